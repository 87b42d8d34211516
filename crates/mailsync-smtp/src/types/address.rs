//! Envelope addresses.

use crate::error::{Error, Result};

/// An address for `MAIL FROM` / `RCPT TO`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates an address from `local@domain`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] unless the input has exactly one `@`
    /// with non-empty sides and no whitespace or angle brackets.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let valid = matches!(
            addr.split_once('@'),
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        ) && !addr
            .chars()
            .any(|c| c.is_whitespace() || c == '<' || c == '>');
        if valid {
            Ok(Self(addr))
        } else {
            Err(Error::InvalidAddress(addr))
        }
    }

    /// Extracts the address from a header value such as
    /// `"Alice Example" <alice@example.com>` or a bare `alice@example.com`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] if no valid address is found.
    pub fn from_header(value: &str) -> Result<Self> {
        let value = value.trim();
        match (value.rfind('<'), value.rfind('>')) {
            (Some(open), Some(close)) if open < close => Self::new(&value[open + 1..close]),
            _ => Self::new(value),
        }
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
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
    fn accepts_plain_address() {
        assert_eq!(Address::new("user@example.com").unwrap().as_str(), "user@example.com");
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "userexample.com", "@example.com", "user@", "a@b@c", "a b@c", "<a@b>"] {
            assert!(Address::new(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn from_header_forms() {
        assert_eq!(
            Address::from_header("\"Alice Example\" <alice@example.com>").unwrap().as_str(),
            "alice@example.com"
        );
        assert_eq!(
            Address::from_header("  bob@example.com ").unwrap().as_str(),
            "bob@example.com"
        );
        assert!(Address::from_header("Undisclosed recipients").is_err());
    }
}
