//! # mailsync-smtp
//!
//! The SMTP submission client used by mailsync to send and forward mail.
//!
//! ## Connection states
//!
//! ```text
//! Connected ── auth_plain() ──→ Authenticated ── mail_from() ──→ MailTransaction
//!                                                                   │ rcpt_to()
//!                                   Data ←── data() ── RecipientAdded
//!                                    │ send_message()
//!                                    └──→ Authenticated
//! ```
//!
//! [`submit`] runs the whole dialog for one message, including implicit TLS
//! or STARTTLS as configured.
//!
//! ## Errors
//!
//! [`Error::kind`] classifies failures the same way the IMAP client does:
//! 4xx replies and network trouble are transient, `503` means the dialog is
//! out of step, other 5xx replies are permanent.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod types;

pub use connection::{
    Authenticated, Client, Connected, Data, MailTransaction, RecipientAdded, Security,
    ServerInfo, SmtpStream, SubmitConfig, connect, deliver, submit,
};
pub use error::{Error, ErrorKind, Result};
pub use types::{Address, Extension, Reply, ReplyCode};
