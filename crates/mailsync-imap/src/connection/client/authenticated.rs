//! Commands valid once logged in.

use tokio::io::{AsyncRead, AsyncWrite};

use super::Client;
use super::states::{Authenticated, Selected};
use crate::Result;
use crate::command::Command;
use crate::parser::{Response, UntaggedResponse};
use crate::types::{MailboxStatus, ResponseCode};

impl<S> Client<S, Authenticated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Selects a mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the mailbox does not exist or cannot be opened.
    pub async fn select(mut self, mailbox: &str) -> Result<Client<S, Selected>> {
        let responses = self
            .run(&Command::Select {
                mailbox: mailbox.to_string(),
            })
            .await?;
        let status = mailbox_status(&responses);
        tracing::debug!(
            mailbox,
            exists = status.exists,
            uid_validity = ?status.uid_validity,
            "mailbox selected"
        );
        Ok(self.into_state(Selected {
            mailbox: mailbox.into(),
            status,
        }))
    }
}

fn mailbox_status(responses: &[Response]) -> MailboxStatus {
    let mut status = MailboxStatus::default();
    for response in responses {
        match response {
            Response::Untagged(UntaggedResponse::Exists(n)) => status.exists = *n,
            Response::Untagged(UntaggedResponse::Status { code: Some(code), .. })
            | Response::Tagged { code: Some(code), .. } => match code {
                ResponseCode::UidValidity(v) => status.uid_validity = Some(*v),
                ResponseCode::UidNext(uid) => status.uid_next = Some(*uid),
                ResponseCode::ReadOnly => status.read_only = true,
                _ => {}
            },
            _ => {}
        }
    }
    status
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
    use crate::{Error, ErrorKind, Uid};

    #[tokio::test]
    async fn select_reads_status() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN u p\r\n")
            .read(b"A0001 OK done\r\n")
            .write(b"A0002 SELECT INBOX\r\n")
            .read(b"* 172 EXISTS\r\n* 1 RECENT\r\n")
            .read(b"* OK [UIDVALIDITY 3857529045] UIDs valid\r\n")
            .read(b"* OK [UIDNEXT 4392] Predicted next UID\r\n")
            .read(b"A0002 OK [READ-WRITE] SELECT completed\r\n")
            .build();
        let client = Client::from_stream(mock).await.unwrap();
        let client = client.login("u", "p").await.unwrap();
        let client = client.select("INBOX").await.unwrap();

        assert_eq!(client.state.mailbox(), "INBOX");
        let status = client.state.status();
        assert_eq!(status.exists, 172);
        assert_eq!(status.uid_validity, Some(3857529045));
        assert_eq!(status.uid_next, Uid::new(4392));
        assert!(!status.read_only);
    }

    #[tokio::test]
    async fn select_missing_mailbox() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN u p\r\n")
            .read(b"A0001 OK done\r\n")
            .write(b"A0002 SELECT Nope\r\n")
            .read(b"A0002 NO [NONEXISTENT] no such mailbox\r\n")
            .build();
        let client = Client::from_stream(mock).await.unwrap();
        let client = client.login("u", "p").await.unwrap();
        let err = client.select("Nope").await.unwrap_err();
        assert!(matches!(err, Error::No { .. }));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
