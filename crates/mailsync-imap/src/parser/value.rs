//! Generic IMAP data values.
//!
//! FETCH responses and BODYSTRUCTURE are nested parenthesized lists of
//! atoms, numbers, strings and NIL. [`Cursor`] reads them into [`Value`]
//! trees so the response parser can pick out the parts it understands.

use crate::{Error, Result};

/// Maximum list nesting accepted from the server.
const MAX_NESTING: usize = 64;

/// One IMAP data value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `NIL`
    Nil,
    /// A number.
    Number(u64),
    /// An atom, including bracketed section specs such as `BODY[HEADER]`.
    Atom(String),
    /// A quoted string or literal.
    String(Vec<u8>),
    /// A parenthesized list.
    List(Vec<Value>),
}

impl Value {
    /// Returns the value as text if it is an atom or valid UTF-8 string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Atom(s) => Some(s),
            Self::String(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a string value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::String(bytes) => Some(bytes),
            Self::Atom(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns the value as a number.
    #[must_use]
    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Atom(s) => s.parse().ok(),
            Self::String(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            _ => None,
        }
    }

    /// Returns the elements of a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns true for `NIL`.
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

/// A read position inside one framed response.
#[derive(Debug)]
pub struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `input`.
    #[must_use]
    pub const fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// Current byte offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Next byte without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    /// Returns true once only the line terminator (or nothing) is left.
    #[must_use]
    pub fn at_line_end(&self) -> bool {
        matches!(self.input.get(self.pos..), None | Some(b"" | b"\r\n" | b"\n"))
    }

    /// Skips spaces.
    pub fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    /// Consumes `expected` or fails.
    pub fn expect(&mut self, expected: u8) -> Result<()> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", char::from(expected))))
        }
    }

    /// Reads bytes up to the next space or line end.
    pub fn word(&mut self) -> &'a str {
        let input = self.input;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b == b' ' || b == b'\r' || b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&input[start..self.pos]).unwrap_or_default()
    }

    /// Reads everything up to the line end.
    pub fn rest_of_line(&mut self) -> String {
        let start = self.pos;
        let end = self.input[start..]
            .iter()
            .position(|&b| b == b'\r' || b == b'\n')
            .map_or(self.input.len(), |offset| start + offset);
        self.pos = end;
        String::from_utf8_lossy(&self.input[start..end]).into_owned()
    }

    /// Reads text up to (not including) `delimiter` and consumes the delimiter.
    pub fn until(&mut self, delimiter: u8) -> Result<&'a str> {
        let input = self.input;
        let start = self.pos;
        let offset = input[start..]
            .iter()
            .position(|&b| b == delimiter)
            .ok_or_else(|| self.error(format!("missing '{}'", char::from(delimiter))))?;
        self.pos = start + offset + 1;
        std::str::from_utf8(&input[start..start + offset])
            .map_err(|_| Error::parse(start, "invalid UTF-8"))
    }

    /// Reads one value.
    pub fn value(&mut self) -> Result<Value> {
        self.value_at_depth(0)
    }

    fn value_at_depth(&mut self, depth: usize) -> Result<Value> {
        match self.peek() {
            Some(b'(') => {
                if depth >= MAX_NESTING {
                    return Err(self.error("lists nested too deeply"));
                }
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_spaces();
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            return Ok(Value::List(items));
                        }
                        None => return Err(self.error("unterminated list")),
                        Some(_) => items.push(self.value_at_depth(depth + 1)?),
                    }
                }
            }
            Some(b'"') => self.quoted().map(Value::String),
            Some(b'{') => self.literal().map(Value::String),
            Some(_) => self.atom(),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn quoted(&mut self) -> Result<Vec<u8>> {
        self.expect(b'"')?;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| self.error("dangling escape"))?;
                    out.push(escaped);
                    self.pos += 1;
                }
                Some(b'\r' | b'\n') | None => return Err(self.error("unterminated string")),
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn literal(&mut self) -> Result<Vec<u8>> {
        self.expect(b'{')?;
        let digits = self.until(b'}')?;
        let len: usize = digits
            .trim_end_matches('+')
            .parse()
            .map_err(|_| self.error("invalid literal length"))?;
        if self.input.get(self.pos..self.pos + 2) != Some(&b"\r\n"[..]) {
            return Err(self.error("literal length not followed by CRLF"));
        }
        self.pos += 2;
        let data = self
            .pos
            .checked_add(len)
            .and_then(|end| self.input.get(self.pos..end))
            .ok_or_else(|| self.error("literal shorter than announced"))?;
        self.pos += len;
        Ok(data.to_vec())
    }

    fn atom(&mut self) -> Result<Value> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            match b {
                b' ' | b'(' | b')' | b'"' | b'{' | b'\r' | b'\n' => break,
                // Section specs may hold spaces and parens: BODY[HEADER.FIELDS (FROM)]
                b'[' => {
                    self.pos += 1;
                    self.until(b']')?;
                }
                _ => self.pos += 1,
            }
        }
        if self.pos == start {
            return Err(self.error("expected a value"));
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        if text.eq_ignore_ascii_case("NIL") {
            Ok(Value::Nil)
        } else if text.bytes().all(|b| b.is_ascii_digit()) {
            text.parse()
                .map(Value::Number)
                .map_err(|_| Error::parse(start, "number out of range"))
        } else {
            Ok(Value::Atom(text))
        }
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::parse(self.pos, message)
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

    fn parse(input: &[u8]) -> Value {
        Cursor::new(input).value().unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(parse(b"NIL"), Value::Nil);
        assert_eq!(parse(b"nil"), Value::Nil);
        assert_eq!(parse(b"4711"), Value::Number(4711));
        assert_eq!(parse(b"\\Seen"), Value::Atom("\\Seen".into()));
        assert_eq!(
            parse(b"\"a \\\"quoted\\\" word\""),
            Value::String(b"a \"quoted\" word".to_vec())
        );
    }

    #[test]
    fn literal_inside_list() {
        let value = parse(b"(BODY[] {5}\r\nhello UID 9)");
        assert_eq!(
            value,
            Value::List(vec![
                Value::Atom("BODY[]".into()),
                Value::String(b"hello".to_vec()),
                Value::Atom("UID".into()),
                Value::Number(9),
            ])
        );
    }

    #[test]
    fn section_spec_keeps_spaces() {
        let value = parse(b"(BODY[HEADER.FIELDS (SUBJECT FROM)] NIL)");
        assert_eq!(
            value.as_list().unwrap()[0],
            Value::Atom("BODY[HEADER.FIELDS (SUBJECT FROM)]".into())
        );
    }

    #[test]
    fn nested_lists() {
        let value = parse(b"((\"TEXT\" \"PLAIN\") \"MIXED\")");
        let outer = value.as_list().unwrap();
        assert_eq!(outer.len(), 2);
        assert_eq!(outer[0].as_list().unwrap()[1].as_str(), Some("PLAIN"));
        assert_eq!(outer[1].as_str(), Some("MIXED"));
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(Cursor::new(b"(unterminated").value().is_err());
        assert!(Cursor::new(b"\"open").value().is_err());
        assert!(Cursor::new(b"{10}\r\nshort").value().is_err());
        assert!(Cursor::new(b")").value().is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let input = format!("{}{}", "(".repeat(100), ")".repeat(100));
        assert!(Cursor::new(input.as_bytes()).value().is_err());
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_panics(input in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = Cursor::new(&input).value();
            }

            #[test]
            fn quoted_strings_round_trip(s in "[a-zA-Z0-9 \\\\\"]{0,40}") {
                let mut wire = Vec::from(&b"\""[..]);
                for b in s.bytes() {
                    if b == b'"' || b == b'\\' {
                        wire.push(b'\\');
                    }
                    wire.push(b);
                }
                wire.push(b'"');
                let value = Cursor::new(&wire).value().unwrap();
                prop_assert_eq!(value, Value::String(s.into_bytes()));
            }
        }
    }
}
