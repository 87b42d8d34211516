//! Transport for SMTP connections.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::error::{Error, Result};

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption. Only for local test servers.
    None,
    /// Plaintext greeting, upgraded with STARTTLS (port 587).
    #[default]
    StartTls,
    /// TLS from the start (port 465).
    Implicit,
}

/// Plain TCP or TLS stream.
pub enum SmtpStream {
    /// Plain TCP connection.
    Plain(TcpStream),
    /// TLS-encrypted connection.
    Tls(Box<TlsStream<TcpStream>>),
}

impl SmtpStream {
    /// Upgrades a plain stream to TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already TLS or the handshake fails.
    pub async fn upgrade_to_tls(self, hostname: &str) -> Result<Self> {
        match self {
            Self::Plain(tcp) => Ok(Self::Tls(Box::new(tls_handshake(hostname, tcp).await?))),
            Self::Tls(_) => Err(Error::Protocol("already using TLS".into())),
        }
    }
}

impl std::fmt::Debug for SmtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plain(_) => "SmtpStream::Plain",
            Self::Tls(_) => "SmtpStream::Tls",
        })
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connects to `hostname:port`, negotiating TLS first for [`Security::Implicit`].
///
/// # Errors
///
/// Returns [`Error::Timeout`] if the connection is not up within `timeout`,
/// or the I/O or TLS error.
pub async fn connect(
    hostname: &str,
    port: u16,
    security: Security,
    timeout: Duration,
) -> Result<SmtpStream> {
    let open = async {
        let tcp = TcpStream::connect((hostname, port)).await?;
        match security {
            Security::Implicit => Ok(SmtpStream::Tls(Box::new(
                tls_handshake(hostname, tcp).await?,
            ))),
            Security::StartTls | Security::None => Ok(SmtpStream::Plain(tcp)),
        }
    };
    tokio::time::timeout(timeout, open)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}

async fn tls_handshake(hostname: &str, tcp: TcpStream) -> Result<TlsStream<TcpStream>> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let server_name = ServerName::try_from(hostname.to_string())?;
    Ok(TlsConnector::from(Arc::new(config))
        .connect(server_name, tcp)
        .await?)
}
