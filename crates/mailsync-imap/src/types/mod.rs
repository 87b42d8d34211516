//! Core IMAP types.

mod identifiers;
mod response_code;

pub use identifiers::{Uid, UidSet};
pub use response_code::ResponseCode;

/// Completion status of a tagged or untagged status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Command completed successfully.
    Ok,
    /// Command failed.
    No,
    /// Command was not understood or not valid in the current state.
    Bad,
    /// Connection begins already authenticated.
    PreAuth,
    /// Server is closing the connection.
    Bye,
}

impl Status {
    /// Parses a status keyword (case-insensitive).
    #[must_use]
    pub fn parse(word: &str) -> Option<Self> {
        match word.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "NO" => Some(Self::No),
            "BAD" => Some(Self::Bad),
            "PREAUTH" => Some(Self::PreAuth),
            "BYE" => Some(Self::Bye),
            _ => None,
        }
    }
}

/// Mailbox state reported by SELECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Number of messages in the mailbox.
    pub exists: u32,
    /// UIDVALIDITY of the mailbox.
    pub uid_validity: Option<u32>,
    /// Next UID the server will assign.
    pub uid_next: Option<Uid>,
    /// Whether the mailbox was opened read-only.
    pub read_only: bool,
}
