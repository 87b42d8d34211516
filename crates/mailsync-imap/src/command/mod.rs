//! IMAP command builder.
//!
//! Only the commands the synchronizer issues are modelled. Each command
//! serializes to a complete tagged line including the trailing CRLF.

mod tag_generator;

pub use tag_generator::TagGenerator;

use crate::types::{Uid, UidSet};

/// Header fields requested when listing messages.
pub const SUMMARY_HEADER_FIELDS: &[&str] = &["SUBJECT", "FROM", "DATE"];

/// IMAP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// CAPABILITY command.
    Capability,
    /// NOOP command, used as a liveness probe.
    Noop,
    /// LOGOUT command.
    Logout,
    /// STARTTLS command.
    StartTls,
    /// LOGIN command.
    Login {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// SELECT command.
    Select {
        /// Mailbox name.
        mailbox: String,
    },
    /// UID SEARCH command.
    UidSearch {
        /// Search criteria.
        criteria: SearchCriteria,
    },
    /// UID FETCH command.
    UidFetch {
        /// Messages to fetch.
        uids: UidSet,
        /// Data items to return.
        items: Vec<FetchAttribute>,
    },
}

/// Criteria understood by [`Command::UidSearch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCriteria {
    /// Every message in the mailbox.
    All,
    /// Messages with a UID of at least this value (`UID n:*`).
    UidFrom(Uid),
}

/// A FETCH data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchAttribute {
    /// `UID`
    Uid,
    /// `RFC822.SIZE`
    Size,
    /// `BODYSTRUCTURE`
    BodyStructure,
    /// `BODY.PEEK[HEADER.FIELDS (...)]`
    HeaderFields(Vec<String>),
    /// `BODY.PEEK[]`, the full message without setting `\Seen`.
    FullBody,
}

impl FetchAttribute {
    /// Header fields used for message summaries.
    #[must_use]
    pub fn summary_headers() -> Self {
        Self::HeaderFields(
            SUMMARY_HEADER_FIELDS
                .iter()
                .map(|field| (*field).to_string())
                .collect(),
        )
    }

    fn write(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Uid => buf.extend_from_slice(b"UID"),
            Self::Size => buf.extend_from_slice(b"RFC822.SIZE"),
            Self::BodyStructure => buf.extend_from_slice(b"BODYSTRUCTURE"),
            Self::HeaderFields(fields) => {
                buf.extend_from_slice(b"BODY.PEEK[HEADER.FIELDS (");
                buf.extend_from_slice(fields.join(" ").as_bytes());
                buf.extend_from_slice(b")]");
            }
            Self::FullBody => buf.extend_from_slice(b"BODY.PEEK[]"),
        }
    }
}

impl Command {
    /// Serializes the command with the given tag.
    #[must_use]
    pub fn serialize(&self, tag: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(tag.as_bytes());
        buf.push(b' ');

        match self {
            Self::Capability => buf.extend_from_slice(b"CAPABILITY"),
            Self::Noop => buf.extend_from_slice(b"NOOP"),
            Self::Logout => buf.extend_from_slice(b"LOGOUT"),
            Self::StartTls => buf.extend_from_slice(b"STARTTLS"),
            Self::Login { username, password } => {
                buf.extend_from_slice(b"LOGIN ");
                write_astring(&mut buf, username);
                buf.push(b' ');
                write_astring(&mut buf, password);
            }
            Self::Select { mailbox } => {
                buf.extend_from_slice(b"SELECT ");
                write_astring(&mut buf, mailbox);
            }
            Self::UidSearch { criteria } => {
                buf.extend_from_slice(b"UID SEARCH ");
                match criteria {
                    SearchCriteria::All => buf.extend_from_slice(b"ALL"),
                    SearchCriteria::UidFrom(uid) => {
                        buf.extend_from_slice(format!("UID {uid}:*").as_bytes());
                    }
                }
            }
            Self::UidFetch { uids, items } => {
                buf.extend_from_slice(b"UID FETCH ");
                buf.extend_from_slice(uids.to_string().as_bytes());
                buf.extend_from_slice(b" (");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        buf.push(b' ');
                    }
                    item.write(&mut buf);
                }
                buf.push(b')');
            }
        }

        buf.extend_from_slice(b"\r\n");
        buf
    }

    /// Returns the command name for logging, without arguments.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Capability => "CAPABILITY",
            Self::Noop => "NOOP",
            Self::Logout => "LOGOUT",
            Self::StartTls => "STARTTLS",
            Self::Login { .. } => "LOGIN",
            Self::Select { .. } => "SELECT",
            Self::UidSearch { .. } => "UID SEARCH",
            Self::UidFetch { .. } => "UID FETCH",
        }
    }
}

/// Writes an astring (atom or quoted string).
fn write_astring(buf: &mut Vec<u8>, s: &str) {
    if s.is_empty() || s.bytes().any(needs_quoting) {
        buf.push(b'"');
        for b in s.bytes() {
            if b == b'"' || b == b'\\' {
                buf.push(b'\\');
            }
            buf.push(b);
        }
        buf.push(b'"');
    } else {
        buf.extend_from_slice(s.as_bytes());
    }
}

const fn needs_quoting(b: u8) -> bool {
    matches!(
        b,
        b' ' | b'"' | b'\\' | b'(' | b')' | b'{' | b'%' | b'*' | b']'
    ) || b < 0x20
        || b >= 0x7F
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

    fn text(cmd: &Command) -> String {
        String::from_utf8(cmd.serialize("A0001")).unwrap()
    }

    #[test]
    fn login_quotes_when_needed() {
        let cmd = Command::Login {
            username: "user@example.com".into(),
            password: "p\"a ss".into(),
        };
        assert_eq!(text(&cmd), "A0001 LOGIN user@example.com \"p\\\"a ss\"\r\n");
    }

    #[test]
    fn select_plain_mailbox() {
        let cmd = Command::Select {
            mailbox: "INBOX".into(),
        };
        assert_eq!(text(&cmd), "A0001 SELECT INBOX\r\n");
    }

    #[test]
    fn search_from_uid() {
        let cmd = Command::UidSearch {
            criteria: SearchCriteria::UidFrom(Uid::new(101).unwrap()),
        };
        assert_eq!(text(&cmd), "A0001 UID SEARCH UID 101:*\r\n");
        let all = Command::UidSearch {
            criteria: SearchCriteria::All,
        };
        assert_eq!(text(&all), "A0001 UID SEARCH ALL\r\n");
    }

    #[test]
    fn fetch_summary_items() {
        let cmd = Command::UidFetch {
            uids: UidSet::new([Uid::new(3).unwrap(), Uid::new(4).unwrap()]),
            items: vec![
                FetchAttribute::Uid,
                FetchAttribute::Size,
                FetchAttribute::BodyStructure,
                FetchAttribute::summary_headers(),
            ],
        };
        assert_eq!(
            text(&cmd),
            "A0001 UID FETCH 3:4 (UID RFC822.SIZE BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS (SUBJECT FROM DATE)])\r\n"
        );
    }

    #[test]
    fn command_names() {
        assert_eq!(Command::Noop.name(), "NOOP");
        assert_eq!(
            Command::Login {
                username: String::new(),
                password: String::new()
            }
            .name(),
            "LOGIN"
        );
    }
}
