//! Error types for the IMAP library.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::{ResponseCode, Uid};

/// How a failure should be handled by whoever retries the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network-level trouble. Worth retrying on a new connection after a pause.
    Transient,
    /// The session and the server disagree about protocol state.
    /// The session must be replaced; the network is assumed fine.
    ProtocolState,
    /// Retrying cannot change the outcome.
    Permanent,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transient => "transient",
            Self::ProtocolState => "protocol-state",
            Self::Permanent => "permanent",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during IMAP operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake or encryption error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Response could not be parsed.
    #[error("Parse error at position {position}: {message}")]
    Parse {
        /// Byte position where the error occurred.
        position: usize,
        /// Description of what went wrong.
        message: String,
    },

    /// LOGIN was rejected.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Server completed a command with NO.
    #[error("Server returned NO: {text}")]
    No {
        /// Bracketed response code, if the server sent one.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },

    /// Server completed a command with BAD.
    #[error("Server returned BAD: {0}")]
    Bad(String),

    /// Server sent BYE (disconnecting).
    #[error("Server sent BYE: {0}")]
    Bye(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Command issued in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unexpected data from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered a UID FETCH without data for the message.
    #[error("Message UID {0} not found")]
    MessageNotFound(Uid),
}

impl Error {
    /// Classifies the error for retry purposes.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) => io_kind(e),
            Self::Tls(e) => tls_kind(e),
            Self::Timeout(_) | Self::Bye(_) => ErrorKind::Transient,
            Self::Parse { .. } | Self::Bad(_) | Self::InvalidState(_) | Self::Protocol(_) => {
                ErrorKind::ProtocolState
            }
            Self::No { code, .. } => match code {
                Some(code) if code.is_temporary() => ErrorKind::Transient,
                _ => ErrorKind::Permanent,
            },
            Self::InvalidDnsName(_) | Self::Auth(_) | Self::MessageNotFound(_) => {
                ErrorKind::Permanent
            }
        }
    }

    /// Returns true if the error means the addressed message no longer exists.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::MessageNotFound(_)
                | Self::No {
                    code: Some(ResponseCode::NonExistent),
                    ..
                }
        )
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }
}

fn io_kind(e: &io::Error) -> ErrorKind {
    // tokio-rustls reports handshake failures as io errors wrapping the rustls error.
    if let Some(tls) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        return tls_kind(tls);
    }
    match e.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => {
            ErrorKind::Permanent
        }
        _ => ErrorKind::Transient,
    }
}

const fn tls_kind(e: &rustls::Error) -> ErrorKind {
    match e {
        rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented => {
            ErrorKind::Permanent
        }
        _ => ErrorKind::Transient,
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

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
    fn network_errors_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::ConnectionRefused,
        ] {
            let err = Error::Io(io::Error::new(kind, "boom"));
            assert_eq!(err.kind(), ErrorKind::Transient, "{kind:?}");
        }
        assert_eq!(
            Error::Timeout(Duration::from_secs(5)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(Error::Bye("shutting down".into()).kind(), ErrorKind::Transient);
    }

    #[test]
    fn wrapped_certificate_errors_are_permanent() {
        let tls = rustls::Error::InvalidCertificate(rustls::CertificateError::Expired);
        let err = Error::Io(io::Error::new(io::ErrorKind::InvalidData, tls));
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn state_errors_are_protocol_state() {
        assert_eq!(
            Error::Bad("Command received in Invalid state.".into()).kind(),
            ErrorKind::ProtocolState
        );
        assert_eq!(Error::parse(3, "junk").kind(), ErrorKind::ProtocolState);
        assert_eq!(
            Error::InvalidState("not selected".into()).kind(),
            ErrorKind::ProtocolState
        );
    }

    #[test]
    fn no_is_classified_by_response_code() {
        let busy = Error::No {
            code: Some(ResponseCode::Unavailable),
            text: "try later".into(),
        };
        assert_eq!(busy.kind(), ErrorKind::Transient);

        let gone = Error::No {
            code: Some(ResponseCode::NonExistent),
            text: "no such message".into(),
        };
        assert_eq!(gone.kind(), ErrorKind::Permanent);
        assert!(gone.is_not_found());

        let plain = Error::No {
            code: None,
            text: "nope".into(),
        };
        assert_eq!(plain.kind(), ErrorKind::Permanent);
        assert!(!plain.is_not_found());
    }

    #[test]
    fn missing_message_is_permanent() {
        let err = Error::MessageNotFound(Uid::new(7).unwrap());
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Message UID 7 not found");
    }
}
