//! Commands valid with a mailbox selected.

use tokio::io::{AsyncRead, AsyncWrite};

use super::Client;
use super::states::{Authenticated, Selected};
use crate::Result;
use crate::command::{Command, FetchAttribute, SearchCriteria};
use crate::parser::{FetchItem, Response, UntaggedResponse};
use crate::types::{MailboxStatus, Uid, UidSet};

impl<S> Client<S, Selected>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns the name of the selected mailbox.
    #[must_use]
    pub fn mailbox(&self) -> &str {
        self.state.mailbox()
    }

    /// Returns the status reported by SELECT.
    #[must_use]
    pub const fn mailbox_status(&self) -> &MailboxStatus {
        self.state.status()
    }

    /// Selects a different mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox cannot be selected.
    pub async fn reselect(self, mailbox: &str) -> Result<Self> {
        self.into_state(Authenticated).select(mailbox).await
    }

    /// Runs UID SEARCH and returns matching UIDs in server order.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_search(&mut self, criteria: SearchCriteria) -> Result<Vec<Uid>> {
        let responses = self.run(&Command::UidSearch { criteria }).await?;
        Ok(responses
            .into_iter()
            .filter_map(|response| match response {
                Response::Untagged(UntaggedResponse::Search(uids)) => Some(uids),
                _ => None,
            })
            .flatten()
            .collect())
    }

    /// Runs UID FETCH and returns the data items of each FETCH response.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn uid_fetch(
        &mut self,
        uids: UidSet,
        items: Vec<FetchAttribute>,
    ) -> Result<Vec<Vec<FetchItem>>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let responses = self.run(&Command::UidFetch { uids, items }).await?;
        Ok(responses
            .into_iter()
            .filter_map(|response| match response {
                Response::Untagged(UntaggedResponse::Fetch { items, .. }) => Some(items),
                _ => None,
            })
            .collect())
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

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    fn builder() -> tokio_test::io::Builder {
        let mut builder = tokio_test::io::Builder::new();
        builder
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN u p\r\n")
            .read(b"A0001 OK done\r\n")
            .write(b"A0002 SELECT INBOX\r\n")
            .read(b"* 3 EXISTS\r\nA0002 OK SELECT completed\r\n");
        builder
    }

    async fn selected(mock: tokio_test::io::Mock) -> Client<tokio_test::io::Mock, Selected> {
        Client::from_stream(mock)
            .await
            .unwrap()
            .login("u", "p")
            .await
            .unwrap()
            .select("INBOX")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn search_from_uid() {
        let mut builder = builder();
        builder
            .write(b"A0003 UID SEARCH UID 5:*\r\n")
            .read(b"* SEARCH 5 9 12\r\nA0003 OK SEARCH completed\r\n");
        let mut client = selected(builder.build()).await;
        let uids = client
            .uid_search(SearchCriteria::UidFrom(uid(5)))
            .await
            .unwrap();
        assert_eq!(uids, vec![uid(5), uid(9), uid(12)]);
    }

    #[tokio::test]
    async fn empty_search() {
        let mut builder = builder();
        builder
            .write(b"A0003 UID SEARCH ALL\r\n")
            .read(b"* SEARCH\r\nA0003 OK SEARCH completed\r\n");
        let mut client = selected(builder.build()).await;
        assert!(client.uid_search(SearchCriteria::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_full_body() {
        let mut builder = builder();
        builder
            .write(b"A0003 UID FETCH 7 (UID BODY.PEEK[])\r\n")
            .read(b"* 2 FETCH (UID 7 BODY[] {11}\r\nhello world)\r\n")
            .read(b"A0003 OK FETCH completed\r\n");
        let mut client = selected(builder.build()).await;
        let fetched = client
            .uid_fetch(
                UidSet::new([uid(7)]),
                vec![FetchAttribute::Uid, FetchAttribute::FullBody],
            )
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0][0], FetchItem::Uid(uid(7)));
        assert_eq!(
            fetched[0][1],
            FetchItem::Section {
                section: String::new(),
                data: Some(b"hello world".to_vec()),
            }
        );
    }

    #[tokio::test]
    async fn empty_fetch_sends_nothing() {
        let mut client = selected(builder().build()).await;
        let fetched = client
            .uid_fetch(UidSet::new([]), vec![FetchAttribute::Uid])
            .await
            .unwrap();
        assert!(fetched.is_empty());
    }
}
