//! Commands valid before authentication.

use tokio::io::{AsyncRead, AsyncWrite};

use super::Client;
use super::states::{Authenticated, NotAuthenticated};
use crate::command::{Command, TagGenerator};
use crate::connection::framed::FramedStream;
use crate::connection::stream::ImapStream;
use crate::parser::{Response, ResponseParser, UntaggedResponse};
use crate::types::{ResponseCode, Status};
use crate::{Error, Result};

impl<S> Client<S, NotAuthenticated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a client from a connected stream and reads the greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bye`] if the server refuses the connection, or a
    /// protocol error if the greeting is not a status response.
    pub async fn from_stream(stream: S) -> Result<Self> {
        Self::from_framed(FramedStream::new(stream)).await
    }

    /// Like [`from_stream`](Self::from_stream) for an already framed stream.
    ///
    /// # Errors
    ///
    /// See [`from_stream`](Self::from_stream).
    pub async fn from_framed(mut stream: FramedStream<S>) -> Result<Self> {
        let greeting = stream.read_response().await?;
        let capabilities = match ResponseParser::parse(&greeting)? {
            Response::Untagged(UntaggedResponse::Status {
                status: Status::Ok | Status::PreAuth,
                code,
                ..
            }) => match code {
                Some(ResponseCode::Capability(caps)) => caps,
                _ => Vec::new(),
            },
            Response::Untagged(UntaggedResponse::Status {
                status: Status::Bye,
                text,
                ..
            }) => return Err(Error::Bye(text)),
            other => return Err(Error::Protocol(format!("unexpected greeting: {other:?}"))),
        };

        Ok(Self {
            stream,
            tag_gen: TagGenerator::default(),
            capabilities,
            state: NotAuthenticated,
        })
    }

    /// Authenticates with LOGIN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the credentials are rejected. A NO with a
    /// temporary response code (e.g. `[UNAVAILABLE]`) is returned as
    /// [`Error::No`] so it stays retryable.
    pub async fn login(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Client<S, Authenticated>> {
        let command = Command::Login {
            username: username.to_string(),
            password: password.to_string(),
        };
        match self.run(&command).await {
            Ok(responses) => {
                for response in responses {
                    if let Response::Untagged(UntaggedResponse::Capability(caps))
                    | Response::Tagged {
                        code: Some(ResponseCode::Capability(caps)),
                        ..
                    } = response
                    {
                        self.capabilities = caps;
                    }
                }
                Ok(self.into_state(Authenticated))
            }
            Err(Error::No { code, text }) if !code.as_ref().is_some_and(ResponseCode::is_temporary) => {
                Err(Error::Auth(text))
            }
            Err(e) => Err(e),
        }
    }
}

impl Client<ImapStream, NotAuthenticated> {
    /// Upgrades the connection with STARTTLS and refreshes capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the server refuses or the handshake fails.
    pub async fn starttls(mut self, host: &str) -> Result<Self> {
        self.run(&Command::StartTls).await?;

        let io_timeout = self.stream.io_timeout();
        let tls = self.stream.into_inner().upgrade_to_tls(host).await?;
        let mut stream = FramedStream::new(tls);
        if let Some(limit) = io_timeout {
            stream = stream.with_io_timeout(limit);
        }

        let mut client = Self {
            stream,
            tag_gen: self.tag_gen,
            capabilities: Vec::new(),
            state: NotAuthenticated,
        };
        client.capability().await?;
        Ok(client)
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

    #[tokio::test]
    async fn login_success_updates_capabilities() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN user \"pass word\"\r\n")
            .read(b"A0001 OK [CAPABILITY IMAP4rev1 IDLE] logged in\r\n")
            .build();
        let client = Client::from_stream(mock).await.unwrap();
        let client = client.login("user", "pass word").await.unwrap();
        assert!(client.has_capability("IDLE"));
    }

    #[tokio::test]
    async fn rejected_login_is_permanent() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN user secret\r\n")
            .read(b"A0001 NO [AUTHENTICATIONFAILED] invalid credentials\r\n")
            .build();
        let client = Client::from_stream(mock).await.unwrap();
        let err = client.login("user", "secret").await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn unavailable_login_is_transient() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 LOGIN user secret\r\n")
            .read(b"A0001 NO [UNAVAILABLE] try later\r\n")
            .build();
        let client = Client::from_stream(mock).await.unwrap();
        let err = client.login("user", "secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
