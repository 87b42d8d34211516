//! Message data models.

use chrono::{DateTime, Utc};

use crate::error::{Error, ErrorKind};
use crate::AccountId;

/// Row id of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Processing state of a message.
///
/// ```text
/// Pending ──claim──▶ Claimed ──▶ Done
///    ▲                  │  ├───▶ PermanentFailure
///    └──transient/stop──┘  └───▶ Deleted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Waiting for the content phase (also used to re-queue).
    Pending,
    /// Owned by a running content phase.
    Claimed,
    /// Content stored.
    Done,
    /// Content can never be fetched.
    PermanentFailure,
    /// The message is gone from the server.
    Deleted,
}

impl MessageStatus {
    /// Column value.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Pending => -1,
            Self::Claimed => 0,
            Self::Done => 1,
            Self::PermanentFailure => -2,
            Self::Deleted => -3,
        }
    }

    /// Parses a column value.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(Self::Pending),
            0 => Some(Self::Claimed),
            1 => Some(Self::Done),
            -2 => Some(Self::PermanentFailure),
            -3 => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Status a claimed message moves to when its content fetch fails.
    #[must_use]
    pub fn after_failure(error: &Error) -> Self {
        if error.is_message_gone() {
            return Self::Deleted;
        }
        match error.kind() {
            ErrorKind::Permanent => Self::PermanentFailure,
            ErrorKind::Transient | ErrorKind::ProtocolState => Self::Pending,
        }
    }

    /// Returns true once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::PermanentFailure | Self::Deleted)
    }
}

/// Header data of a message seen by the list phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    /// Provider-assigned UID.
    pub uid: u32,
    /// Decoded subject.
    pub subject: String,
    /// Decoded sender.
    pub from: String,
    /// Date header, when it parses.
    pub date: Option<DateTime<Utc>>,
    /// Whether any part is an attachment.
    pub has_attachment: bool,
    /// Size in octets.
    pub size: u32,
}

/// A stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Row id.
    pub id: MessageId,
    /// Owning account.
    pub account_id: AccountId,
    /// Provider-assigned UID.
    pub uid: u32,
    /// Subject.
    pub subject: String,
    /// Sender.
    pub from: String,
    /// Date header.
    pub date: Option<DateTime<Utc>>,
    /// Whether any part is an attachment.
    pub has_attachment: bool,
    /// Processing state.
    pub status: MessageStatus,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// An attachment row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    /// File name.
    pub filename: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type.
    pub mime_type: String,
    /// Where the bytes were uploaded; `None` if every upload attempt failed.
    pub storage_url: Option<String>,
}

/// Content of one message ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    /// Message the content belongs to.
    pub message_id: MessageId,
    /// Plain-text body.
    pub body: String,
    /// HTML body.
    pub html_body: String,
    /// Attachment descriptors.
    pub attachments: Vec<AttachmentRecord>,
}

/// Content as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    /// Plain-text body.
    pub body: String,
    /// HTML body.
    pub html_body: String,
    /// Attachment descriptors.
    pub attachments: Vec<AttachmentRecord>,
}

/// Number of messages per status for one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Pending messages.
    pub pending: u64,
    /// Claimed messages.
    pub claimed: u64,
    /// Done messages.
    pub done: u64,
    /// Permanently failed messages.
    pub failed: u64,
    /// Deleted messages.
    pub deleted: u64,
}

impl StatusCounts {
    /// Total number of messages.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.failed + self.deleted
    }
}

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
    fn status_codes() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Claimed,
            MessageStatus::Done,
            MessageStatus::PermanentFailure,
            MessageStatus::Deleted,
        ] {
            assert_eq!(MessageStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(MessageStatus::Pending.code(), -1);
        assert_eq!(MessageStatus::Deleted.code(), -3);
        assert_eq!(MessageStatus::from_code(7), None);
    }

    #[test]
    fn failure_mapping() {
        let timeout = Error::from(mailsync_imap::Error::Timeout(Duration::from_secs(1)));
        assert_eq!(MessageStatus::after_failure(&timeout), MessageStatus::Pending);

        let desync = Error::from(mailsync_imap::Error::Bad("bad sequence".into()));
        assert_eq!(MessageStatus::after_failure(&desync), MessageStatus::Pending);

        let refused = Error::from(mailsync_imap::Error::No {
            code: Some(ResponseCode::NonExistent),
            text: "not found".into(),
        });
        assert_eq!(
            MessageStatus::after_failure(&refused),
            MessageStatus::PermanentFailure
        );

        let gone = Error::from(mailsync_imap::Error::MessageNotFound(Uid::new(3).unwrap()));
        assert_eq!(MessageStatus::after_failure(&gone), MessageStatus::Deleted);
    }

    #[test]
    fn terminal_states() {
        assert!(!MessageStatus::Pending.is_terminal());
        assert!(!MessageStatus::Claimed.is_terminal());
        assert!(MessageStatus::Done.is_terminal());
        assert!(MessageStatus::Deleted.is_terminal());
    }
}
