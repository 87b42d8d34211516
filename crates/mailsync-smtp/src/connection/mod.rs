//! SMTP connection management with type-state.

mod client;
mod stream;
mod submit;

pub use client::{Authenticated, Client, Connected, Data, MailTransaction, RecipientAdded};
pub use stream::{Security, SmtpStream, connect};
pub use submit::{SubmitConfig, deliver, submit};

use std::collections::HashSet;

use crate::types::Extension;

/// What the server announced in its greeting and EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Server hostname from the greeting.
    pub hostname: String,
    /// Advertised extensions.
    pub extensions: HashSet<Extension>,
}

impl ServerInfo {
    /// Checks if the server advertised an extension.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.contains(ext)
    }

    /// Returns the advertised maximum message size.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.extensions.iter().find_map(|ext| match ext {
            Extension::Size(size) => *size,
            _ => None,
        })
    }

    /// Returns true if `AUTH PLAIN` was advertised.
    #[must_use]
    pub fn supports_auth_plain(&self) -> bool {
        self.extensions.iter().any(|ext| {
            matches!(ext, Extension::Auth(mechanisms) if mechanisms.iter().any(|m| m == "PLAIN"))
        })
    }
}
