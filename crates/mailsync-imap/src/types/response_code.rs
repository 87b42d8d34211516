//! Response codes.

use super::Uid;

/// Bracketed response code from a status response (`* OK [UIDNEXT 5] ...`).
///
/// Only the codes the client acts on are modelled; anything else is kept as
/// [`ResponseCode::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// ALERT: Human-readable message that MUST be shown to user.
    Alert,
    /// CAPABILITY list sent inline.
    Capability(Vec<String>),
    /// READ-ONLY: Mailbox selected as read-only.
    ReadOnly,
    /// READ-WRITE: Mailbox selected as read-write.
    ReadWrite,
    /// TRYCREATE: Mailbox doesn't exist, but can be created.
    TryCreate,
    /// UIDNEXT: Next UID to be assigned.
    UidNext(Uid),
    /// UIDVALIDITY: Unique identifier validity value.
    UidValidity(u32),
    /// NONEXISTENT (RFC 5530): the addressed object does not exist.
    NonExistent,
    /// UNAVAILABLE (RFC 5530): temporary server-side failure.
    Unavailable,
    /// INUSE (RFC 5530): resource is locked by another session.
    InUse,
    /// LIMIT (RFC 5530): a server limit was hit.
    Limit,
    /// SERVERBUG (RFC 5530).
    ServerBug,
    /// AUTHENTICATIONFAILED (RFC 5530).
    AuthenticationFailed,
    /// Unknown response code.
    Unknown(String),
}

impl ResponseCode {
    /// Parses the text between `[` and `]`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut words = text.split_ascii_whitespace();
        let Some(name) = words.next() else {
            return Self::Unknown(String::new());
        };
        match name.to_ascii_uppercase().as_str() {
            "ALERT" => Self::Alert,
            "CAPABILITY" => Self::Capability(words.map(str::to_ascii_uppercase).collect()),
            "READ-ONLY" => Self::ReadOnly,
            "READ-WRITE" => Self::ReadWrite,
            "TRYCREATE" => Self::TryCreate,
            "NONEXISTENT" => Self::NonExistent,
            "UNAVAILABLE" => Self::Unavailable,
            "INUSE" => Self::InUse,
            "LIMIT" => Self::Limit,
            "SERVERBUG" => Self::ServerBug,
            "AUTHENTICATIONFAILED" => Self::AuthenticationFailed,
            "UIDNEXT" => words
                .next()
                .and_then(|n| n.parse().ok())
                .and_then(Uid::new)
                .map_or_else(|| Self::Unknown(text.to_string()), Self::UidNext),
            "UIDVALIDITY" => words
                .next()
                .and_then(|n| n.parse().ok())
                .map_or_else(|| Self::Unknown(text.to_string()), Self::UidValidity),
            _ => Self::Unknown(text.to_string()),
        }
    }

    /// Returns true for codes that describe a condition expected to clear up.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::InUse | Self::Limit | Self::ServerBug
        )
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
    fn parses_known_codes() {
        assert_eq!(ResponseCode::parse("READ-WRITE"), ResponseCode::ReadWrite);
        assert_eq!(ResponseCode::parse("nonexistent"), ResponseCode::NonExistent);
        assert_eq!(
            ResponseCode::parse("UIDNEXT 4392"),
            ResponseCode::UidNext(Uid::new(4392).unwrap())
        );
        assert_eq!(
            ResponseCode::parse("UIDVALIDITY 3857529045"),
            ResponseCode::UidValidity(3857529045)
        );
        assert_eq!(
            ResponseCode::parse("CAPABILITY IMAP4rev1 starttls"),
            ResponseCode::Capability(vec!["IMAP4REV1".into(), "STARTTLS".into()])
        );
    }

    #[test]
    fn malformed_numbers_stay_unknown() {
        assert_eq!(
            ResponseCode::parse("UIDNEXT x"),
            ResponseCode::Unknown("UIDNEXT x".into())
        );
    }

    #[test]
    fn temporary_codes() {
        assert!(ResponseCode::Unavailable.is_temporary());
        assert!(ResponseCode::InUse.is_temporary());
        assert!(!ResponseCode::NonExistent.is_temporary());
        assert!(!ResponseCode::Alert.is_temporary());
    }
}
