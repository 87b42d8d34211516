//! Type-state markers for client connection states.

use std::sync::Arc;

use crate::types::MailboxStatus;

/// Before LOGIN. Only STARTTLS, CAPABILITY and LOGIN are meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotAuthenticated;

/// Logged in, no folder selected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Authenticated;

/// A folder is selected. Carries what SELECT reported.
#[derive(Debug, Clone)]
pub struct Selected {
    pub(crate) mailbox: Arc<str>,
    pub(crate) status: MailboxStatus,
}

impl Selected {
    /// Returns the name of the selected mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    /// Returns the status reported when the mailbox was selected.
    #[must_use]
    pub const fn status(&self) -> &MailboxStatus {
        &self.status
    }
}
