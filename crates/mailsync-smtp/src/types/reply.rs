//! SMTP reply types.

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Text of each reply line, without code and separator.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    pub const fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Returns true for a 2xx reply.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns the reply text as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }

    /// Converts a reply other than `expected` into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reply`](crate::Error::Reply) if the code differs.
    pub fn expect_code(self, expected: ReplyCode) -> crate::Result<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(crate::Error::reply(self.code.as_u16(), self.message_text()))
        }
    }

    /// Converts a non-2xx reply into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reply`](crate::Error::Reply) unless the reply is 2xx.
    pub fn expect_success(self) -> crate::Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(crate::Error::reply(self.code.as_u16(), self.message_text()))
        }
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 235 Authentication succeeded
    pub const AUTH_SUCCESS: Self = Self(235);
    /// 250 Requested action completed
    pub const OK: Self = Self(250);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);

    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true for 2xx.
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
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
    use crate::{Error, ErrorKind};

    fn reply(code: u16, text: &str) -> Reply {
        Reply::new(ReplyCode::new(code), vec![text.to_string()])
    }

    #[test]
    fn expect_success() {
        assert!(reply(250, "ok").expect_success().is_ok());
        let err = reply(452, "mailbox full").expect_success().unwrap_err();
        assert!(matches!(err, Error::Reply { code: 452, .. }));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn expect_code() {
        assert!(reply(354, "go ahead").expect_code(ReplyCode::START_DATA).is_ok());
        assert!(reply(250, "ok").expect_code(ReplyCode::START_DATA).is_err());
    }

    #[test]
    fn multi_line_text() {
        let reply = Reply::new(ReplyCode::OK, vec!["a".into(), "b".into()]);
        assert_eq!(reply.message_text(), "a\nb");
    }
}
