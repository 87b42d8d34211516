//! # mailsync-imap
//!
//! The IMAP client underneath the mailsync engine. It covers the slice of
//! RFC 3501 a synchronizer needs: connect (implicit TLS, STARTTLS or plain),
//! LOGIN, SELECT, UID SEARCH, UID FETCH, NOOP and LOGOUT.
//!
//! ## Layers
//!
//! - [`connection::FramedStream`] reads CRLF lines and embedded `{n}` literals.
//! - [`parser`] turns one framed response into a [`Response`].
//! - [`Client`] is a type-state client (`NotAuthenticated` → `Authenticated`
//!   → `Selected`), so commands can only be issued in a valid state.
//! - [`Session`] owns a client for one account and one folder and tracks its
//!   protocol state at runtime, which is what a connection pool stores.
//!
//! ## Errors
//!
//! Every [`Error`] reports an [`ErrorKind`]. The kind is fixed by the variant
//! that was produced, so retry decisions never look at error text:
//!
//! ```text
//! Transient      network trouble, timeouts, BYE, NO [UNAVAILABLE]
//! ProtocolState  BAD, parse failures, commands in the wrong state
//! Permanent      authentication, NO [NONEXISTENT], missing messages
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use mailsync_imap::{SearchCriteria, Session, SessionConfig};
//!
//! let config = SessionConfig::new("imap.example.com", 993)
//!     .credentials("user@example.com", "secret");
//! let mut session = Session::open(&config).await?;
//! let uids = session.search(SearchCriteria::All).await?;
//! let summaries = session.fetch_summaries(&uids).await?;
//! session.logout().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod types;

pub use command::{Command, FetchAttribute, SearchCriteria, TagGenerator};
pub use connection::{
    Authenticated, Client, Config, ConfigBuilder, FetchedSummary, FramedStream, ImapStream,
    NotAuthenticated, Security, Selected, Session, SessionConfig, SessionState,
};
pub use error::{Error, ErrorKind, Result};
pub use parser::{BodyStructure, FetchItem, Response, ResponseParser, UntaggedResponse, Value};
pub use types::{MailboxStatus, ResponseCode, Status, Uid, UidSet};
