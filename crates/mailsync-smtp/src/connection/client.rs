//! Type-state SMTP client.

use std::collections::HashSet;
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::ServerInfo;
use super::stream::SmtpStream;
use crate::command::{Command, encode_data};
use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::{Address, Extension, Reply, ReplyCode};

/// Longest reply line accepted from the server.
const MAX_LINE_LENGTH: usize = 4096;

/// After the greeting (and EHLO).
#[derive(Debug)]
pub struct Connected;

/// After AUTH, or after a completed transaction.
#[derive(Debug)]
pub struct Authenticated;

/// After `MAIL FROM`.
#[derive(Debug)]
pub struct MailTransaction;

/// After at least one accepted `RCPT TO`.
#[derive(Debug)]
pub struct RecipientAdded;

/// After DATA was accepted with 354.
#[derive(Debug)]
pub struct Data;

/// SMTP client with type-state.
pub struct Client<S, State> {
    stream: BufReader<S>,
    server_info: ServerInfo,
    io_timeout: Duration,
    state: State,
}

impl<S, State: std::fmt::Debug> std::fmt::Debug for Client<S, State> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_info", &self.server_info)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S> Client<S, Connected>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a client from a stream and reads the 220 greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is not 220.
    pub async fn from_stream(stream: S, io_timeout: Duration) -> Result<Self> {
        let mut client = Self {
            stream: BufReader::new(stream),
            server_info: ServerInfo::default(),
            io_timeout,
            state: Connected,
        };
        let greeting = client.read_reply().await?.expect_code(ReplyCode::SERVICE_READY)?;
        client.server_info.hostname = greeting
            .message
            .first()
            .and_then(|text| text.split_whitespace().next())
            .unwrap_or("unknown")
            .to_string();
        Ok(client)
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if EHLO is rejected.
    pub async fn ehlo(mut self, client_hostname: &str) -> Result<Self> {
        let reply = self
            .send_command(&Command::Ehlo {
                hostname: client_hostname.to_string(),
            })
            .await?
            .expect_success()?;
        self.server_info.extensions = reply
            .message
            .iter()
            .skip(1)
            .map(|line| Extension::parse(line))
            .collect::<HashSet<_>>();
        Ok(self)
    }

    /// Authenticates with `AUTH PLAIN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the credentials.
    pub async fn auth_plain(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Client<S, Authenticated>> {
        let credentials = format!("\0{username}\0{password}");
        let initial_response =
            base64::engine::general_purpose::STANDARD.encode(credentials.as_bytes());
        self.send_command(&Command::AuthPlain { initial_response })
            .await?
            .expect_code(ReplyCode::AUTH_SUCCESS)?;
        Ok(self.into_state(Authenticated))
    }

    /// Skips authentication, for relays that accept unauthenticated mail.
    #[must_use]
    pub fn without_auth(self) -> Client<S, Authenticated> {
        self.into_state(Authenticated)
    }
}

impl Client<SmtpStream, Connected> {
    /// Upgrades the connection with STARTTLS and repeats EHLO.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if STARTTLS was not advertised, or the
    /// reply or handshake error.
    pub async fn starttls(mut self, hostname: &str, client_hostname: &str) -> Result<Self> {
        if !self.server_info.supports(&Extension::StartTls) {
            return Err(Error::NotSupported("STARTTLS".into()));
        }
        self.send_command(&Command::StartTls)
            .await?
            .expect_code(ReplyCode::SERVICE_READY)?;

        let stream = self.stream.into_inner().upgrade_to_tls(hostname).await?;
        let client = Self {
            stream: BufReader::new(stream),
            server_info: ServerInfo {
                hostname: self.server_info.hostname,
                extensions: HashSet::new(),
            },
            io_timeout: self.io_timeout,
            state: Connected,
        };
        client.ehlo(client_hostname).await
    }
}

impl<S> Client<S, Authenticated>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Starts a mail transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if `MAIL FROM` is rejected.
    pub async fn mail_from(mut self, from: Address) -> Result<Client<S, MailTransaction>> {
        self.send_command(&Command::MailFrom { from })
            .await?
            .expect_success()?;
        Ok(self.into_state(MailTransaction))
    }
}

impl<S> Client<S, MailTransaction>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Adds the first recipient.
    ///
    /// # Errors
    ///
    /// Returns an error if `RCPT TO` is rejected.
    pub async fn rcpt_to(mut self, to: Address) -> Result<Client<S, RecipientAdded>> {
        self.send_command(&Command::RcptTo { to })
            .await?
            .expect_success()?;
        Ok(self.into_state(RecipientAdded))
    }
}

impl<S> Client<S, RecipientAdded>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Adds another recipient.
    ///
    /// # Errors
    ///
    /// Returns an error if `RCPT TO` is rejected.
    pub async fn rcpt_to(mut self, to: Address) -> Result<Self> {
        self.send_command(&Command::RcptTo { to })
            .await?
            .expect_success()?;
        Ok(self)
    }

    /// Sends DATA and waits for 354.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer 354.
    pub async fn data(mut self) -> Result<Client<S, Data>> {
        self.send_command(&Command::Data)
            .await?
            .expect_code(ReplyCode::START_DATA)?;
        Ok(self.into_state(Data))
    }
}

impl<S> Client<S, Data>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends the message, dot-stuffed and terminated, and completes the
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails or the server rejects the message.
    pub async fn send_message(mut self, message: &[u8]) -> Result<Client<S, Authenticated>> {
        self.write_all(&encode_data(message)).await?;
        self.read_reply().await?.expect_success()?;
        Ok(self.into_state(Authenticated))
    }
}

impl<S, State> Client<S, State>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Returns what the server advertised.
    #[must_use]
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Sends QUIT. Accepts 221 or any 2xx.
    ///
    /// # Errors
    ///
    /// Returns an error if the server answers with an error.
    pub async fn quit(mut self) -> Result<()> {
        let reply = self.send_command(&Command::Quit).await?;
        if reply.code == ReplyCode::CLOSING || reply.is_success() {
            Ok(())
        } else {
            Err(Error::reply(reply.code.as_u16(), reply.message_text()))
        }
    }

    async fn send_command(&mut self, command: &Command) -> Result<Reply> {
        tracing::trace!(command = command.name(), "smtp command");
        self.write_all(&command.serialize()).await?;
        self.read_reply().await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let limit = self.io_timeout;
        tokio::time::timeout(limit, self.read_reply_lines())
            .await
            .map_err(|_| Error::Timeout(limit))?
    }

    async fn read_reply_lines(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = (&mut self.stream)
                .take(MAX_LINE_LENGTH as u64)
                .read_line(&mut line)
                .await?;
            if read == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
            if !line.ends_with('\n') {
                return Err(Error::Protocol("reply line too long".into()));
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            let last = is_last_reply_line(&line);
            lines.push(line);
            if last {
                return parse_reply(&lines);
            }
        }
    }

    fn into_state<T>(self, state: T) -> Client<S, T> {
        Client {
            stream: self.stream,
            server_info: self.server_info,
            io_timeout: self.io_timeout,
            state,
        }
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
    use tokio_test::io::Builder;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn full_dialog() {
        let mock = Builder::new()
            .read(b"220 smtp.example.com ESMTP\r\n")
            .write(b"EHLO client.local\r\n")
            .read(b"250-smtp.example.com\r\n250-SIZE 1000\r\n250 AUTH PLAIN\r\n")
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"235 2.7.0 accepted\r\n")
            .write(b"MAIL FROM:<a@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<b@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<c@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .write(b"Subject: hi\r\n\r\n..dot\r\n.\r\n")
            .read(b"250 queued\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();

        let client = Client::from_stream(mock, TIMEOUT).await.unwrap();
        assert_eq!(client.server_info().hostname, "smtp.example.com");
        let client = client.ehlo("client.local").await.unwrap();
        assert_eq!(client.server_info().max_message_size(), Some(1000));
        let client = client.auth_plain("user", "pass").await.unwrap();
        let client = client.mail_from(addr("a@example.com")).await.unwrap();
        let client = client.rcpt_to(addr("b@example.com")).await.unwrap();
        let client = client.rcpt_to(addr("c@example.com")).await.unwrap();
        let client = client.data().await.unwrap();
        let client = client.send_message(b"Subject: hi\n\n.dot\n").await.unwrap();
        client.quit().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_auth_is_permanent() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"AUTH PLAIN AHVzZXIAd3Jvbmc=\r\n")
            .read(b"535 5.7.8 bad credentials\r\n")
            .build();
        let client = Client::from_stream(mock, TIMEOUT).await.unwrap();
        let err = client.auth_plain("user", "wrong").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn busy_greeting_is_transient() {
        let mock = Builder::new().read(b"421 too busy\r\n").build();
        let err = Client::from_stream(mock, TIMEOUT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[tokio::test]
    async fn bad_sequence_is_protocol_state() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"MAIL FROM:<a@example.com>\r\n")
            .read(b"503 5.5.1 need AUTH first\r\n")
            .build();
        let client = Client::from_stream(mock, TIMEOUT).await.unwrap().without_auth();
        let err = client.mail_from(addr("a@example.com")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolState);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_times_out() {
        let mock = Builder::new().wait(Duration::from_secs(60)).build();
        let err = Client::from_stream(mock, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
