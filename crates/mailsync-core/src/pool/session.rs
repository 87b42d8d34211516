//! The seam between the pool and the protocol crate.

use std::time::Duration;

use async_trait::async_trait;
use mailsync_imap::{
    Error as ImapError, FetchedSummary, Result as ImapResult, SearchCriteria, Session,
    SessionState, Uid,
};

use crate::account::Account;

/// The operations the engine performs on a selected folder.
#[async_trait]
pub trait MailSession: Send {
    /// Current protocol state.
    fn state(&self) -> SessionState;

    /// Sends NOOP.
    async fn noop(&mut self) -> ImapResult<()>;

    /// Runs UID SEARCH.
    async fn search(&mut self, criteria: SearchCriteria) -> ImapResult<Vec<Uid>>;

    /// Fetches sizes, summary headers and body structures, ordered by UID.
    async fn fetch_summaries(&mut self, uids: &[Uid]) -> ImapResult<Vec<FetchedSummary>>;

    /// Fetches the full source of one message.
    async fn fetch_raw(&mut self, uid: Uid) -> ImapResult<Vec<u8>>;

    /// Logs out, ignoring errors. The session is disconnected afterwards.
    async fn close(&mut self);
}

#[async_trait]
impl MailSession for Session {
    fn state(&self) -> SessionState {
        Self::state(self)
    }

    async fn noop(&mut self) -> ImapResult<()> {
        Self::noop(self).await
    }

    async fn search(&mut self, criteria: SearchCriteria) -> ImapResult<Vec<Uid>> {
        Self::search(self, criteria).await
    }

    async fn fetch_summaries(&mut self, uids: &[Uid]) -> ImapResult<Vec<FetchedSummary>> {
        Self::fetch_summaries(self, uids).await
    }

    async fn fetch_raw(&mut self, uid: Uid) -> ImapResult<Vec<u8>> {
        Self::fetch_raw(self, uid).await
    }

    async fn close(&mut self) {
        Self::close(self).await;
    }
}

/// Opens sessions for accounts.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects, authenticates and selects the sync folder.
    async fn connect(&self, account: &Account) -> ImapResult<Box<dyn MailSession>>;
}

/// Opens real IMAP sessions.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    mailbox: String,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ImapConnector {
    /// Creates a connector selecting `mailbox` on every session.
    #[must_use]
    pub fn new(mailbox: impl Into<String>, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            mailbox: mailbox.into(),
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self, account: &Account) -> ImapResult<Box<dyn MailSession>> {
        let config = account.session_config(&self.mailbox, self.connect_timeout, self.io_timeout);
        let session = Session::open(&config).await?;
        Ok(Box::new(session))
    }
}

/// Stand-in held by an entry whose session was taken away.
pub(super) struct Vacant;

fn vacant() -> ImapError {
    ImapError::InvalidState("no session".to_string())
}

#[async_trait]
impl MailSession for Vacant {
    fn state(&self) -> SessionState {
        SessionState::Disconnected
    }

    async fn noop(&mut self) -> ImapResult<()> {
        Err(vacant())
    }

    async fn search(&mut self, _criteria: SearchCriteria) -> ImapResult<Vec<Uid>> {
        Err(vacant())
    }

    async fn fetch_summaries(&mut self, _uids: &[Uid]) -> ImapResult<Vec<FetchedSummary>> {
        Err(vacant())
    }

    async fn fetch_raw(&mut self, _uid: Uid) -> ImapResult<Vec<u8>> {
        Err(vacant())
    }

    async fn close(&mut self) {}
}
