//! EHLO keywords the client acts on.

/// An extension advertised in the EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// `STARTTLS`
    StartTls,
    /// `AUTH` with its mechanisms, uppercased.
    Auth(Vec<String>),
    /// `SIZE`, with the limit when given.
    Size(Option<usize>),
    /// `8BITMIME`
    EightBitMime,
    /// Anything else, verbatim.
    Other(String),
}

impl Extension {
    /// Parses one EHLO reply line (without the code).
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Self::Other(String::new());
        };
        match keyword.to_ascii_uppercase().as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => Self::Auth(words.map(str::to_ascii_uppercase).collect()),
            "SIZE" => Self::Size(words.next().and_then(|s| s.parse().ok())),
            "8BITMIME" => Self::EightBitMime,
            _ => Self::Other(line.to_string()),
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
    fn parses_keywords() {
        assert_eq!(Extension::parse("starttls"), Extension::StartTls);
        assert_eq!(
            Extension::parse("AUTH plain LOGIN"),
            Extension::Auth(vec!["PLAIN".into(), "LOGIN".into()])
        );
        assert_eq!(Extension::parse("SIZE 35882577"), Extension::Size(Some(35882577)));
        assert_eq!(Extension::parse("SIZE"), Extension::Size(None));
        assert_eq!(Extension::parse("8BITMIME"), Extension::EightBitMime);
        assert_eq!(
            Extension::parse("PIPELINING"),
            Extension::Other("PIPELINING".into())
        );
    }
}
