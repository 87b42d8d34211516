//! SMTP command builder.

use crate::types::Address;

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// EHLO with the client hostname.
    Ehlo {
        /// Client hostname.
        hostname: String,
    },
    /// STARTTLS
    StartTls,
    /// `AUTH PLAIN` with a base64 initial response.
    AuthPlain {
        /// Base64 of `\0user\0password`.
        initial_response: String,
    },
    /// `MAIL FROM:<addr>`
    MailFrom {
        /// Sender address.
        from: Address,
    },
    /// `RCPT TO:<addr>`
    RcptTo {
        /// Recipient address.
        to: Address,
    },
    /// DATA
    Data,
    /// RSET
    Rset,
    /// QUIT
    Quit,
}

impl Command {
    /// Serializes the command including the trailing CRLF.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let line = match self {
            Self::Ehlo { hostname } => format!("EHLO {hostname}"),
            Self::StartTls => "STARTTLS".to_string(),
            Self::AuthPlain { initial_response } => format!("AUTH PLAIN {initial_response}"),
            Self::MailFrom { from } => format!("MAIL FROM:<{from}>"),
            Self::RcptTo { to } => format!("RCPT TO:<{to}>"),
            Self::Data => "DATA".to_string(),
            Self::Rset => "RSET".to_string(),
            Self::Quit => "QUIT".to_string(),
        };
        let mut buf = line.into_bytes();
        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Command verb for logging. Never includes credentials.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Ehlo { .. } => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::AuthPlain { .. } => "AUTH",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
        }
    }
}

/// Normalizes line endings to CRLF, dot-stuffs lines starting with `.`
/// and appends the `.` terminator.
#[must_use]
pub fn encode_data(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let body = message.strip_suffix(b"\n").unwrap_or(message);
    if !body.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.extend_from_slice(b".\r\n");
    out
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
    fn envelope_commands() {
        let from = Address::new("sender@example.com").unwrap();
        assert_eq!(
            Command::MailFrom { from }.serialize(),
            b"MAIL FROM:<sender@example.com>\r\n"
        );
        let to = Address::new("rcpt@example.com").unwrap();
        assert_eq!(Command::RcptTo { to }.serialize(), b"RCPT TO:<rcpt@example.com>\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
    }

    #[test]
    fn auth_name_hides_secret() {
        let cmd = Command::AuthPlain {
            initial_response: "AHVzZXIAcGFzcw==".to_string(),
        };
        assert_eq!(cmd.serialize(), b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n");
        assert_eq!(cmd.name(), "AUTH");
    }

    #[test]
    fn data_is_dot_stuffed_and_terminated() {
        let encoded = encode_data(b"Subject: x\n\n.hidden\r\n..two\nlast");
        assert_eq!(
            encoded,
            b"Subject: x\r\n\r\n..hidden\r\n...two\r\nlast\r\n.\r\n".to_vec()
        );
    }

    #[test]
    fn data_trailing_newline_not_doubled() {
        assert_eq!(encode_data(b"body\r\n"), b"body\r\n.\r\n".to_vec());
        assert_eq!(encode_data(b""), b".\r\n".to_vec());
    }
}
