//! Error types for the core library.

use thiserror::Error;

pub use mailsync_imap::ErrorKind;

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// IMAP operation failed.
    #[error("IMAP error: {0}")]
    Imap(#[from] mailsync_imap::Error),

    /// SMTP submission failed.
    #[error("SMTP error: {0}")]
    Smtp(#[from] mailsync_smtp::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message source could not be parsed.
    #[error("MIME error: {0}")]
    Mime(#[from] mailparse::MailParseError),

    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Message not found in the local store.
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The requested attachment does not exist.
    #[error("Attachment {index} not found in message UID {uid}")]
    AttachmentNotFound {
        /// Message UID.
        uid: u32,
        /// Requested attachment index.
        index: usize,
    },

    /// An operation kept failing until its attempts ran out.
    #[error("Gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last failure.
        source: Box<Error>,
    },

    /// Object storage rejected an upload.
    #[error("Object store error: {0}")]
    ObjectStore(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation was cancelled by shutdown.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Classifies the error the same way the protocol crates do.
    ///
    /// Storage, configuration and parse failures are permanent: retrying the
    /// same input cannot help.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Imap(e) => e.kind(),
            Self::Smtp(e) => smtp_kind(e.kind()),
            Self::RetriesExhausted { source, .. } => source.kind(),
            Self::Io(_) | Self::ObjectStore(_) | Self::Cancelled => ErrorKind::Transient,
            Self::Database(_)
            | Self::Serde(_)
            | Self::Mime(_)
            | Self::AccountNotFound(_)
            | Self::MessageNotFound(_)
            | Self::AttachmentNotFound { .. }
            | Self::Config(_) => ErrorKind::Permanent,
        }
    }

    /// Returns true if the server no longer has the addressed message.
    #[must_use]
    pub fn is_message_gone(&self) -> bool {
        match self {
            Self::Imap(mailsync_imap::Error::MessageNotFound(_)) => true,
            Self::RetriesExhausted { source, .. } => source.is_message_gone(),
            _ => false,
        }
    }

    /// Returns true if no session can be opened for the account at all, so
    /// fetching any of its messages would fail the same way.
    #[must_use]
    pub fn is_account_failure(&self) -> bool {
        match self {
            Self::Imap(mailsync_imap::Error::Auth(_) | mailsync_imap::Error::InvalidDnsName(_)) => {
                true
            }
            Self::RetriesExhausted { source, .. } => source.is_account_failure(),
            _ => false,
        }
    }
}

pub(crate) const fn smtp_kind(kind: mailsync_smtp::ErrorKind) -> ErrorKind {
    match kind {
        mailsync_smtp::ErrorKind::Transient => ErrorKind::Transient,
        mailsync_smtp::ErrorKind::ProtocolState => ErrorKind::ProtocolState,
        mailsync_smtp::ErrorKind::Permanent => ErrorKind::Permanent,
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use mailsync_imap::{ResponseCode, Uid};
    use std::time::Duration;

    #[test]
    fn protocol_kinds_pass_through() {
        let err = Error::from(mailsync_imap::Error::Timeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = Error::from(mailsync_imap::Error::Bad("bad sequence".into()));
        assert_eq!(err.kind(), ErrorKind::ProtocolState);

        let err = Error::from(mailsync_smtp::Error::reply(452, "mailbox full"));
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = Error::from(mailsync_smtp::Error::reply(503, "bad sequence"));
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
    }

    #[test]
    fn exhausted_retries_keep_the_cause_kind() {
        let err = Error::RetriesExhausted {
            attempts: 5,
            source: Box::new(mailsync_imap::Error::Bye("later".into()).into()),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("5 attempts"));
    }

    #[test]
    fn gone_only_for_missing_messages() {
        let uid = Uid::new(9).unwrap();
        assert!(Error::from(mailsync_imap::Error::MessageNotFound(uid)).is_message_gone());

        let refused = Error::from(mailsync_imap::Error::No {
            code: Some(ResponseCode::NonExistent),
            text: "not found".into(),
        });
        assert!(!refused.is_message_gone());
        assert_eq!(refused.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn rejected_login_fails_the_account() {
        let denied = Error::from(mailsync_imap::Error::Auth("denied".into()));
        assert!(denied.is_account_failure());

        let missing = Error::from(mailsync_imap::Error::MessageNotFound(Uid::new(1).unwrap()));
        assert!(!missing.is_account_failure());
    }
}
