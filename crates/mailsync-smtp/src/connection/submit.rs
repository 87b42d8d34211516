//! One-shot message submission.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::client::{Authenticated, Client, Connected};
use super::stream::{self, Security};
use crate::error::{Error, Result};
use crate::types::{Address, Extension};

/// Where and how to submit mail for one account.
#[derive(Clone)]
pub struct SubmitConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// AUTH PLAIN user; empty skips authentication.
    pub username: String,
    /// AUTH PLAIN password.
    pub password: String,
    /// Name sent with EHLO.
    pub client_hostname: String,
    /// Limit for connecting plus TLS handshake.
    pub connect_timeout: Duration,
    /// Limit for each reply.
    pub io_timeout: Duration,
}

impl SubmitConfig {
    /// Creates a configuration for `host:port` using STARTTLS.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: Security::StartTls,
            username: String::new(),
            password: String::new(),
            client_hostname: "localhost".to_string(),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets both transport timeouts.
    #[must_use]
    pub const fn timeouts(mut self, connect: Duration, io: Duration) -> Self {
        self.connect_timeout = connect;
        self.io_timeout = io;
        self
    }
}

impl std::fmt::Debug for SubmitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Connects, authenticates and submits one message to `recipients`.
///
/// # Errors
///
/// Returns the first failure of the dialog. Use [`Error::kind`] to decide
/// whether to retry.
pub async fn submit(
    config: &SubmitConfig,
    from: &Address,
    recipients: &[Address],
    message: &[u8],
) -> Result<()> {
    if recipients.is_empty() {
        return Err(Error::InvalidAddress("no recipients".into()));
    }
    let stream = stream::connect(
        &config.host,
        config.port,
        config.security,
        config.connect_timeout,
    )
    .await?;
    let client = Client::from_stream(stream, config.io_timeout)
        .await?
        .ehlo(&config.client_hostname)
        .await?;

    let client = if config.security == Security::StartTls {
        if client.server_info().supports(&Extension::StartTls) {
            client.starttls(&config.host, &config.client_hostname).await?
        } else {
            tracing::warn!(host = %config.host, "STARTTLS not advertised, continuing in plaintext");
            client
        }
    } else {
        client
    };

    let client = authenticate(client, config).await?;
    deliver(client, from, recipients, message).await
}

async fn authenticate<S>(
    client: Client<S, Connected>,
    config: &SubmitConfig,
) -> Result<Client<S, Authenticated>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if config.username.is_empty() {
        Ok(client.without_auth())
    } else {
        client.auth_plain(&config.username, &config.password).await
    }
}

/// Runs one mail transaction on an authenticated client and quits.
///
/// # Errors
///
/// Returns the first rejected command.
pub async fn deliver<S>(
    client: Client<S, Authenticated>,
    from: &Address,
    recipients: &[Address],
    message: &[u8],
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some((first, rest)) = recipients.split_first() else {
        return Err(Error::InvalidAddress("no recipients".into()));
    };
    let mut client = client
        .mail_from(from.clone())
        .await?
        .rcpt_to(first.clone())
        .await?;
    for to in rest {
        client = client.rcpt_to(to.clone()).await?;
    }
    let client = client.data().await?.send_message(message).await?;
    tracing::debug!(from = %from, recipients = recipients.len(), "message accepted");

    if let Err(e) = client.quit().await {
        tracing::debug!(error = %e, "QUIT failed after delivery");
    }
    Ok(())
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

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[tokio::test]
    async fn deliver_to_two_recipients() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"MAIL FROM:<a@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<b@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<c@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go\r\n")
            .write(b"hello\r\n.\r\n")
            .read(b"250 queued\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();
        let client = Client::from_stream(mock, Duration::from_secs(5))
            .await
            .unwrap()
            .without_auth();
        deliver(
            client,
            &addr("a@example.com"),
            &[addr("b@example.com"), addr("c@example.com")],
            b"hello",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rejected_recipient_is_permanent() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"MAIL FROM:<a@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<nobody@example.com>\r\n")
            .read(b"550 5.1.1 no such user\r\n")
            .build();
        let client = Client::from_stream(mock, Duration::from_secs(5))
            .await
            .unwrap()
            .without_auth();
        let err = deliver(
            client,
            &addr("a@example.com"),
            &[addr("nobody@example.com")],
            b"x",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[tokio::test]
    async fn submit_requires_recipients() {
        let config = SubmitConfig::new("smtp.example.com", 587);
        let err = submit(&config, &addr("a@example.com"), &[], b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
    }

    #[test]
    fn debug_hides_password() {
        let config = SubmitConfig::new("smtp.example.com", 587).credentials("u", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
