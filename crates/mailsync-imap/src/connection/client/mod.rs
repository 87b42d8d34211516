//! Type-state IMAP client.
//!
//! `Client<S, NotAuthenticated>` → `Client<S, Authenticated>` →
//! `Client<S, Selected>`. Each state only exposes the commands valid in it.

mod authenticated;
mod not_authenticated;
mod selected;
mod states;

use tokio::io::{AsyncRead, AsyncWrite};

pub use self::states::{Authenticated, NotAuthenticated, Selected};
use super::framed::FramedStream;
use crate::command::{Command, TagGenerator};
use crate::parser::{Response, ResponseParser, UntaggedResponse};
use crate::types::Status;
use crate::{Error, Result};

/// IMAP client connection with type-state.
pub struct Client<S, State> {
    pub(crate) stream: FramedStream<S>,
    pub(crate) tag_gen: TagGenerator,
    pub(crate) capabilities: Vec<String>,
    pub(crate) state: State,
}

impl<S, State: std::fmt::Debug> std::fmt::Debug for Client<S, State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("tag_gen", &self.tag_gen)
            .field("capabilities", &self.capabilities)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S, State> Client<S, State>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns the server capabilities, uppercased.
    #[must_use]
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Checks if the server advertised a capability (case-insensitive).
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .any(|cap| cap.eq_ignore_ascii_case(name))
    }

    /// Sends NOOP. Used as a liveness probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer OK.
    pub async fn noop(&mut self) -> Result<()> {
        self.run(&Command::Noop).await.map(drop)
    }

    /// Sends CAPABILITY and stores the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn capability(&mut self) -> Result<Vec<String>> {
        let responses = self.run(&Command::Capability).await?;
        for response in responses {
            if let Response::Untagged(UntaggedResponse::Capability(caps)) = response {
                self.capabilities = caps;
            }
        }
        Ok(self.capabilities.clone())
    }

    /// Sends LOGOUT and closes the connection.
    ///
    /// The untagged BYE the server sends first is expected here.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails or the server rejects the command.
    pub async fn logout(mut self) -> Result<()> {
        let tag = self.tag_gen.next_tag();
        self.stream
            .write_command(&Command::Logout.serialize(&tag))
            .await?;
        loop {
            let raw = self.stream.read_response().await?;
            if let Response::Tagged {
                tag: got,
                status,
                code,
                text,
            } = ResponseParser::parse(&raw)?
                && got == tag
            {
                return completion(status, code, text);
            }
        }
    }

    /// Writes `command` and collects responses up to its tagged completion.
    pub(crate) async fn run(&mut self, command: &Command) -> Result<Vec<Response>> {
        let tag = self.tag_gen.next_tag();
        tracing::trace!(command = command.name(), %tag, "sending command");
        self.stream.write_command(&command.serialize(&tag)).await?;
        let responses = self.read_until_tagged(&tag).await?;
        Self::check_tagged_ok(&responses, &tag)?;
        Ok(responses)
    }

    /// Reads responses until the tagged response for `tag`.
    ///
    /// An untagged BYE ends the session and is returned as an error.
    pub(crate) async fn read_until_tagged(&mut self, tag: &str) -> Result<Vec<Response>> {
        let mut responses = Vec::new();
        loop {
            let raw = self.stream.read_response().await?;
            let response = ResponseParser::parse(&raw)?;
            match &response {
                Response::Untagged(UntaggedResponse::Status {
                    status: Status::Bye,
                    text,
                    ..
                }) => return Err(Error::Bye(text.clone())),
                Response::Tagged { tag: got, .. } if got == tag => {
                    responses.push(response);
                    return Ok(responses);
                }
                _ => responses.push(response),
            }
        }
    }

    /// Checks that the tagged completion for `tag` is OK.
    pub(crate) fn check_tagged_ok(responses: &[Response], tag: &str) -> Result<()> {
        for response in responses.iter().rev() {
            if let Response::Tagged {
                tag: got,
                status,
                code,
                text,
            } = response
                && got == tag
            {
                return completion(*status, code.clone(), text.clone());
            }
        }
        Err(Error::Protocol("missing tagged response".to_string()))
    }

    pub(crate) fn into_state<T>(self, state: T) -> Client<S, T> {
        Client {
            stream: self.stream,
            tag_gen: self.tag_gen,
            capabilities: self.capabilities,
            state,
        }
    }
}

fn completion(
    status: Status,
    code: Option<crate::types::ResponseCode>,
    text: String,
) -> Result<()> {
    match status {
        Status::Ok | Status::PreAuth => Ok(()),
        Status::No => Err(Error::No { code, text }),
        Status::Bad => Err(Error::Bad(text)),
        Status::Bye => Err(Error::Bye(text)),
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
    use crate::ErrorKind;
    use crate::types::ResponseCode;

    async fn greeted(mock: tokio_test::io::Mock) -> Client<tokio_test::io::Mock, NotAuthenticated> {
        Client::from_stream(mock).await.unwrap()
    }

    #[tokio::test]
    async fn greeting_capabilities() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK [CAPABILITY IMAP4rev1 STARTTLS] ready\r\n")
            .build();
        let client = greeted(mock).await;
        assert!(client.has_capability("starttls"));
        assert!(!client.has_capability("IDLE"));
    }

    #[tokio::test]
    async fn greeting_bye_is_transient() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* BYE too many connections\r\n")
            .build();
        let err = Client::from_stream(mock).await.unwrap_err();
        assert!(matches!(err, Error::Bye(_)));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn noop_collects_untagged() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 NOOP\r\n")
            .read(b"* 3 EXISTS\r\nA0001 OK NOOP completed\r\n")
            .build();
        let mut client = greeted(mock).await;
        client.noop().await.unwrap();
    }

    #[tokio::test]
    async fn tagged_no_keeps_code() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 NOOP\r\n")
            .read(b"A0001 NO [UNAVAILABLE] backend down\r\n")
            .build();
        let mut client = greeted(mock).await;
        let err = client.noop().await.unwrap_err();
        assert!(matches!(
            err,
            Error::No {
                code: Some(ResponseCode::Unavailable),
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn tagged_bad_is_protocol_state() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 NOOP\r\n")
            .read(b"A0001 BAD command unknown\r\n")
            .build();
        let mut client = greeted(mock).await;
        let err = client.noop().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
    }

    #[tokio::test]
    async fn untagged_bye_mid_command() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 NOOP\r\n")
            .read(b"* BYE idle timeout\r\n")
            .build();
        let mut client = greeted(mock).await;
        assert!(matches!(client.noop().await, Err(Error::Bye(_))));
    }

    #[tokio::test]
    async fn logout_accepts_bye() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGOUT\r\n")
            .read(b"* BYE logging out\r\nA0001 OK LOGOUT completed\r\n")
            .build();
        let client = greeted(mock).await;
        client.logout().await.unwrap();
    }
}
