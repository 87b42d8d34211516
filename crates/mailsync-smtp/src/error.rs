//! Error types for SMTP operations.

use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// How a failure should be handled by whoever retries the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Retry later, on a new connection.
    Transient,
    /// The client and server disagree about the dialog state.
    ProtocolState,
    /// Retrying cannot change the outcome.
    Permanent,
}

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Server answered with an unexpected reply code.
    #[error("SMTP error {code}: {message}")]
    Reply {
        /// Reply code (e.g., 550).
        code: u16,
        /// Reply text.
        message: String,
    },

    /// Malformed reply.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Feature not supported by server.
    #[error("Server does not support {0}")]
    NotSupported(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Creates an error from a reply code and message.
    #[must_use]
    pub fn reply(code: u16, message: impl Into<String>) -> Self {
        Self::Reply {
            code,
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Timeout(_) => ErrorKind::Transient,
            Self::Tls(
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented,
            )
            | Self::InvalidDnsName(_)
            | Self::InvalidAddress(_)
            | Self::NotSupported(_) => ErrorKind::Permanent,
            Self::Tls(_) => ErrorKind::Transient,
            Self::Protocol(_) | Self::Reply { code: 503, .. } => ErrorKind::ProtocolState,
            Self::Reply { code, .. } if (400..500).contains(code) => ErrorKind::Transient,
            Self::Reply { .. } => ErrorKind::Permanent,
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

    #[test]
    fn reply_classification() {
        assert_eq!(Error::reply(421, "closing").kind(), ErrorKind::Transient);
        assert_eq!(Error::reply(451, "try later").kind(), ErrorKind::Transient);
        assert_eq!(Error::reply(503, "bad sequence").kind(), ErrorKind::ProtocolState);
        assert_eq!(Error::reply(535, "auth failed").kind(), ErrorKind::Permanent);
        assert_eq!(Error::reply(550, "no such user").kind(), ErrorKind::Permanent);
    }

    #[test]
    fn transport_classification() {
        let reset = Error::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(reset.kind(), ErrorKind::Transient);
        assert_eq!(
            Error::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::Protocol("garbage".into()).kind(),
            ErrorKind::ProtocolState
        );
    }
}
