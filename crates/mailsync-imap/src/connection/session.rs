//! A logged-in connection for one account and one folder.
//!
//! [`Session`] hides the type-state transitions behind `&mut self` methods
//! and tracks at runtime which state the connection is in. A session never
//! reconnects by itself: once a transient or protocol-state error is seen it
//! drops the connection and reports [`SessionState::Disconnected`], and the
//! owner opens a new one.

use tokio::io::{AsyncRead, AsyncWrite};

use super::client::{Authenticated, Client, NotAuthenticated, Selected};
use super::config::{Security, SessionConfig};
use super::framed::FramedStream;
use super::stream::{self, ImapStream};
use crate::command::{FetchAttribute, SearchCriteria};
use crate::parser::{BodyStructure, FetchItem};
use crate::types::{MailboxStatus, Uid, UidSet};
use crate::{Error, ErrorKind, Result};

/// Runtime protocol state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The connection is gone or unusable.
    Disconnected,
    /// Logged in, no folder selected.
    Authenticated,
    /// Logged in with the configured folder selected.
    FolderSelected,
}

/// Summary data of one message as returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSummary {
    /// Message UID.
    pub uid: Uid,
    /// RFC822.SIZE in octets.
    pub size: u32,
    /// Raw `Subject`, `From` and `Date` header lines.
    pub header: Vec<u8>,
    /// Body structure, when the server sent it.
    pub body_structure: Option<BodyStructure>,
}

enum Stage<S> {
    Disconnected,
    Authenticated(Client<S, Authenticated>),
    Selected(Client<S, Selected>),
}

/// A logged-in IMAP connection.
pub struct Session<S = ImapStream> {
    stage: Stage<S>,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.stage {
            Stage::Disconnected => SessionState::Disconnected,
            Stage::Authenticated(_) => SessionState::Authenticated,
            Stage::Selected(_) => SessionState::FolderSelected,
        };
        f.debug_struct("Session").field("state", &state).finish()
    }
}

impl Session<ImapStream> {
    /// Connects, logs in and selects `config.mailbox`.
    ///
    /// # Errors
    ///
    /// Returns the first error of connecting, STARTTLS, LOGIN or SELECT.
    pub async fn open(config: &SessionConfig) -> Result<Self> {
        let client = Self::greet(config).await?;
        Self::establish(client, config).await
    }

    /// Connects and logs in without selecting a folder.
    ///
    /// # Errors
    ///
    /// Returns the first error of connecting, STARTTLS or LOGIN.
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        let client = Self::greet(config).await?;
        let client = client.login(&config.username, &config.password).await?;
        Ok(Self {
            stage: Stage::Authenticated(client),
        })
    }

    async fn greet(config: &SessionConfig) -> Result<Client<ImapStream, NotAuthenticated>> {
        let transport = &config.transport;
        let stream = stream::connect(transport).await?;
        let framed = FramedStream::new(stream).with_io_timeout(transport.io_timeout);
        let client = Client::from_framed(framed).await?;
        if transport.security == Security::StartTls {
            return client.starttls(&transport.host).await;
        }
        Ok(client)
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Builds a session over an already connected stream: reads the greeting,
    /// logs in and selects `config.mailbox`.
    ///
    /// # Errors
    ///
    /// Returns the first error of the greeting, LOGIN or SELECT.
    pub async fn from_stream(stream: S, config: &SessionConfig) -> Result<Self> {
        let client = Client::from_stream(stream).await?;
        Self::establish(client, config).await
    }

    async fn establish(
        client: Client<S, NotAuthenticated>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let client = client.login(&config.username, &config.password).await?;
        let client = client.select(&config.mailbox).await?;
        tracing::debug!(
            host = %config.transport.host,
            user = %config.username,
            mailbox = %config.mailbox,
            "imap session established"
        );
        Ok(Self {
            stage: Stage::Selected(client),
        })
    }

    /// Returns the current protocol state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        match self.stage {
            Stage::Disconnected => SessionState::Disconnected,
            Stage::Authenticated(_) => SessionState::Authenticated,
            Stage::Selected(_) => SessionState::FolderSelected,
        }
    }

    /// Returns the status reported by the last SELECT.
    #[must_use]
    pub fn mailbox_status(&self) -> Option<&MailboxStatus> {
        match &self.stage {
            Stage::Selected(client) => Some(client.mailbox_status()),
            _ => None,
        }
    }

    /// Selects `mailbox`, replacing any current selection.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is disconnected or SELECT fails. The
    /// session is disconnected afterwards in either case.
    pub async fn select(&mut self, mailbox: &str) -> Result<()> {
        let selected = match std::mem::replace(&mut self.stage, Stage::Disconnected) {
            Stage::Authenticated(client) => client.select(mailbox).await?,
            Stage::Selected(client) => client.reselect(mailbox).await?,
            Stage::Disconnected => return Err(disconnected()),
        };
        self.stage = Stage::Selected(selected);
        Ok(())
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is disconnected or the probe fails.
    pub async fn noop(&mut self) -> Result<()> {
        let result = match &mut self.stage {
            Stage::Authenticated(client) => client.noop().await,
            Stage::Selected(client) => client.noop().await,
            Stage::Disconnected => return Err(disconnected()),
        };
        self.track(result)
    }

    /// Runs UID SEARCH in the selected folder.
    ///
    /// # Errors
    ///
    /// Returns an error if no folder is selected or the command fails.
    pub async fn search(&mut self, criteria: SearchCriteria) -> Result<Vec<Uid>> {
        let result = self.selected()?.uid_search(criteria).await;
        self.track(result)
    }

    /// Fetches UID, size, body structure and summary headers of `uids`.
    ///
    /// Results are ordered by ascending UID. Unsolicited FETCH data for other
    /// messages is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if no folder is selected or the command fails.
    pub async fn fetch_summaries(&mut self, uids: &[Uid]) -> Result<Vec<FetchedSummary>> {
        let set = UidSet::new(uids.iter().copied());
        let items = vec![
            FetchAttribute::Uid,
            FetchAttribute::Size,
            FetchAttribute::BodyStructure,
            FetchAttribute::summary_headers(),
        ];
        let result = self.selected()?.uid_fetch(set.clone(), items).await;
        let fetched = self.track(result)?;

        let mut summaries: Vec<FetchedSummary> = fetched
            .into_iter()
            .filter_map(summary)
            .filter(|summary| set.contains(summary.uid))
            .collect();
        summaries.sort_by_key(|summary| summary.uid);
        summaries.dedup_by_key(|summary| summary.uid);
        Ok(summaries)
    }

    /// Fetches the complete RFC 822 source of one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageNotFound`] if the server returns no data for
    /// `uid`, or the command error.
    pub async fn fetch_raw(&mut self, uid: Uid) -> Result<Vec<u8>> {
        let items = vec![FetchAttribute::Uid, FetchAttribute::FullBody];
        let result = self
            .selected()?
            .uid_fetch(UidSet::new([uid]), items)
            .await;
        let fetched = self.track(result)?;

        fetched
            .into_iter()
            .filter(|items| items.contains(&FetchItem::Uid(uid)))
            .flatten()
            .find_map(|item| match item {
                FetchItem::Section {
                    section,
                    data: Some(data),
                } if section.is_empty() => Some(data),
                _ => None,
            })
            .ok_or(Error::MessageNotFound(uid))
    }

    /// Logs out. Errors are logged and otherwise ignored.
    pub async fn logout(self) {
        let result = match self.stage {
            Stage::Authenticated(client) => client.logout().await,
            Stage::Selected(client) => client.logout().await,
            Stage::Disconnected => return,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "logout failed");
        }
    }

    /// Logs out in place, leaving the session disconnected.
    pub async fn close(&mut self) {
        let stage = std::mem::replace(&mut self.stage, Stage::Disconnected);
        Self { stage }.logout().await;
    }

    fn selected(&mut self) -> Result<&mut Client<S, Selected>> {
        match &mut self.stage {
            Stage::Selected(client) => Ok(client),
            Stage::Authenticated(_) => Err(Error::InvalidState("no folder selected".to_string())),
            Stage::Disconnected => Err(disconnected()),
        }
    }

    /// Drops the connection after errors that leave it in an unknown state.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result
            && e.kind() != ErrorKind::Permanent
        {
            self.stage = Stage::Disconnected;
        }
        result
    }
}

fn disconnected() -> Error {
    Error::InvalidState("session is disconnected".to_string())
}

fn summary(items: Vec<FetchItem>) -> Option<FetchedSummary> {
    let mut uid = None;
    let mut size = 0;
    let mut header = Vec::new();
    let mut body_structure = None;
    for item in items {
        match item {
            FetchItem::Uid(u) => uid = Some(u),
            FetchItem::Size(n) => size = n,
            FetchItem::BodyStructure(structure) => body_structure = Some(structure),
            FetchItem::Section {
                section,
                data: Some(data),
            } if section.to_ascii_uppercase().starts_with("HEADER") => header = data,
            _ => {}
        }
    }
    Some(FetchedSummary {
        uid: uid?,
        size,
        header,
        body_structure,
    })
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
    use tokio_test::io::{Builder, Mock};

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    fn config() -> SessionConfig {
        SessionConfig::new("imap.example.com", 993).credentials("u", "p")
    }

    fn login() -> Builder {
        let mut builder = Builder::new();
        builder
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN u p\r\n")
            .read(b"A0001 OK done\r\n")
            .write(b"A0002 SELECT INBOX\r\n")
            .read(b"* 2 EXISTS\r\n* OK [UIDVALIDITY 9] ok\r\nA0002 OK done\r\n");
        builder
    }

    async fn open(mock: Mock) -> Session<Mock> {
        Session::from_stream(mock, &config()).await.unwrap()
    }

    #[tokio::test]
    async fn open_selects_folder() {
        let session = open(login().build()).await;
        assert_eq!(session.state(), SessionState::FolderSelected);
        assert_eq!(session.mailbox_status().unwrap().uid_validity, Some(9));
    }

    #[tokio::test]
    async fn summaries_sorted_and_filtered() {
        let mut builder = login();
        builder
            .write(b"A0003 UID FETCH 4,9 (UID RFC822.SIZE BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS (SUBJECT FROM DATE)])\r\n")
            .read(b"* 2 FETCH (UID 9 RFC822.SIZE 200 BODY[HEADER.FIELDS (SUBJECT FROM DATE)] {14}\r\nSubject: two\r\n)\r\n")
            .read(b"* 1 FETCH (UID 4 RFC822.SIZE 100 BODY[HEADER.FIELDS (SUBJECT FROM DATE)] {14}\r\nSubject: one\r\n)\r\n")
            .read(b"* 5 FETCH (UID 77 FLAGS (\\Seen))\r\n")
            .read(b"A0003 OK done\r\n");
        let mut session = open(builder.build()).await;

        let summaries = session.fetch_summaries(&[uid(9), uid(4)]).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].uid, uid(4));
        assert_eq!(summaries[0].size, 100);
        assert_eq!(summaries[0].header, b"Subject: one\r\n");
        assert_eq!(summaries[1].uid, uid(9));
    }

    #[tokio::test]
    async fn fetch_raw_without_data_is_not_found() {
        let mut builder = login();
        builder
            .write(b"A0003 UID FETCH 5 (UID BODY.PEEK[])\r\n")
            .read(b"A0003 OK done\r\n");
        let mut session = open(builder.build()).await;

        let err = session.fetch_raw(uid(5)).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(session.state(), SessionState::FolderSelected);
    }

    #[tokio::test]
    async fn transient_error_disconnects() {
        let mut builder = login();
        builder
            .write(b"A0003 NOOP\r\n")
            .read(b"* BYE shutting down\r\n");
        let mut session = open(builder.build()).await;

        assert!(session.noop().await.is_err());
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.search(SearchCriteria::All).await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn bad_response_disconnects() {
        let mut builder = login();
        builder
            .write(b"A0003 UID SEARCH ALL\r\n")
            .read(b"A0003 BAD no mailbox selected\r\n");
        let mut session = open(builder.build()).await;

        let err = session.search(SearchCriteria::All).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
