//! BODYSTRUCTURE interpretation.
//!
//! Only what the synchronizer needs is kept: the MIME type of each part,
//! its parameters and its Content-Disposition.

use super::value::Value;
use crate::{Error, Result};

/// Maximum part nesting interpreted; deeper structures are rejected.
const MAX_DEPTH: usize = 16;

/// Content-Disposition of a body part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    /// Disposition type, lowercased (`attachment`, `inline`, ...).
    pub kind: String,
    /// Parameters with lowercased names.
    pub params: Vec<(String, String)>,
}

impl Disposition {
    /// Returns the `filename` parameter, if any.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        param(&self.params, "filename")
    }
}

/// The MIME structure of a message as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyStructure {
    /// A leaf part.
    Single {
        /// Lowercased media type, e.g. `text`.
        media_type: String,
        /// Lowercased subtype, e.g. `plain`.
        subtype: String,
        /// Content-Type parameters with lowercased names.
        params: Vec<(String, String)>,
        /// Encoded size in octets.
        size: u64,
        /// Content-Disposition, when the server sent extension data.
        disposition: Option<Disposition>,
    },
    /// A multipart container.
    Multipart {
        /// Child parts in order.
        parts: Vec<BodyStructure>,
        /// Lowercased subtype, e.g. `mixed`.
        subtype: String,
        /// Content-Disposition, when the server sent extension data.
        disposition: Option<Disposition>,
    },
}

impl BodyStructure {
    /// Interprets a BODYSTRUCTURE value.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the value is not a valid body structure.
    pub fn from_value(value: &Value) -> Result<Self> {
        Self::at_depth(value, 0)
    }

    fn at_depth(value: &Value, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::parse(0, "body structure nested too deeply"));
        }
        let items = value
            .as_list()
            .ok_or_else(|| Error::parse(0, "body structure is not a list"))?;

        if items.first().is_some_and(|first| first.as_list().is_some()) {
            let split = items
                .iter()
                .position(|item| item.as_list().is_none())
                .unwrap_or(items.len());
            let parts = items[..split]
                .iter()
                .map(|part| Self::at_depth(part, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            let subtype = items.get(split).map_or_else(String::new, lower);
            // body-ext-mpart: params, then disposition
            let disposition = items.get(split + 2).and_then(disposition);
            return Ok(Self::Multipart {
                parts,
                subtype,
                disposition,
            });
        }

        let media_type = items.first().map_or_else(String::new, lower);
        let subtype = items.get(1).map_or_else(String::new, lower);
        let params = items.get(2).map(pairs).unwrap_or_default();
        let size = items.get(6).and_then(Value::as_number).unwrap_or(0);

        // Fields 0-6 are common; text adds a line count, message/rfc822 adds
        // envelope, body and line count. MD5 precedes the disposition.
        let extra = match (media_type.as_str(), subtype.as_str()) {
            ("text", _) => 1,
            ("message", "rfc822" | "global") => 3,
            _ => 0,
        };
        let disposition = items.get(7 + extra + 1).and_then(disposition);

        Ok(Self::Single {
            media_type,
            subtype,
            params,
            size,
            disposition,
        })
    }

    /// Returns true if any part is presented as an attachment: disposition
    /// `attachment`, or `inline` with a filename.
    #[must_use]
    pub fn has_attachment(&self) -> bool {
        match self {
            Self::Single { disposition, .. } => disposition.as_ref().is_some_and(|d| {
                d.kind == "attachment" || (d.kind == "inline" && d.filename().is_some())
            }),
            Self::Multipart { parts, .. } => parts.iter().any(Self::has_attachment),
        }
    }

    /// Full MIME type of the part, e.g. `text/plain` or `multipart/mixed`.
    #[must_use]
    pub fn mime_type(&self) -> String {
        match self {
            Self::Single {
                media_type,
                subtype,
                ..
            } => format!("{media_type}/{subtype}"),
            Self::Multipart { subtype, .. } => format!("multipart/{subtype}"),
        }
    }
}

fn lower(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_ascii_lowercase()
}

fn pairs(value: &Value) -> Vec<(String, String)> {
    value
        .as_list()
        .map(|items| {
            items
                .chunks_exact(2)
                .map(|pair| {
                    (
                        lower(&pair[0]),
                        pair[1].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

fn disposition(value: &Value) -> Option<Disposition> {
    let items = value.as_list()?;
    Some(Disposition {
        kind: lower(items.first()?),
        params: items.get(1).map(pairs).unwrap_or_default(),
    })
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
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
    use crate::parser::value::Cursor;

    fn structure(input: &str) -> BodyStructure {
        let value = Cursor::new(input.as_bytes()).value().unwrap();
        BodyStructure::from_value(&value).unwrap()
    }

    #[test]
    fn plain_text_message() {
        let body = structure(
            r#"("TEXT" "PLAIN" ("CHARSET" "UTF-8") NIL NIL "7BIT" 1152 23 NIL NIL NIL NIL)"#,
        );
        assert_eq!(body.mime_type(), "text/plain");
        assert!(!body.has_attachment());
        if let BodyStructure::Single { params, size, .. } = &body {
            assert_eq!(params, &[("charset".to_string(), "UTF-8".to_string())]);
            assert_eq!(*size, 1152);
        } else {
            panic!("expected single part");
        }
    }

    #[test]
    fn mixed_with_pdf_attachment() {
        let body = structure(concat!(
            r#"(("TEXT" "PLAIN" ("CHARSET" "us-ascii") NIL NIL "7BIT" 12 1 NIL NIL NIL NIL)"#,
            r#"("APPLICATION" "PDF" ("NAME" "q3.pdf") NIL NIL "BASE64" 4096 NIL"#,
            r#" ("ATTACHMENT" ("FILENAME" "q3.pdf")) NIL NIL)"#,
            r#" "MIXED" ("BOUNDARY" "xyz") NIL NIL NIL)"#,
        ));
        assert_eq!(body.mime_type(), "multipart/mixed");
        assert!(body.has_attachment());
    }

    #[test]
    fn inline_image_needs_filename() {
        let unnamed = structure(concat!(
            r#"(("TEXT" "HTML" NIL NIL NIL "QUOTED-PRINTABLE" 300 8 NIL NIL NIL NIL)"#,
            r#"("IMAGE" "PNG" NIL "<logo>" NIL "BASE64" 900 NIL ("INLINE" NIL) NIL NIL)"#,
            r#" "RELATED")"#,
        ));
        assert!(!unnamed.has_attachment());

        let named = structure(concat!(
            r#"(("TEXT" "HTML" NIL NIL NIL "QUOTED-PRINTABLE" 300 8 NIL NIL NIL NIL)"#,
            r#"("IMAGE" "PNG" NIL NIL NIL "BASE64" 900 NIL ("INLINE" ("FILENAME" "chart.png")) NIL NIL)"#,
            r#" "RELATED")"#,
        ));
        assert!(named.has_attachment());
    }

    #[test]
    fn forwarded_message_attachment() {
        let body = structure(concat!(
            r#"(("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1 NIL NIL NIL NIL)"#,
            r#"("MESSAGE" "RFC822" NIL NIL NIL "7BIT" 500 NIL"#,
            r#" ("TEXT" "PLAIN" NIL NIL NIL "7BIT" 20 2 NIL NIL NIL NIL) 12"#,
            r#" NIL ("ATTACHMENT" ("FILENAME" "original.eml")) NIL NIL)"#,
            r#" "MIXED")"#,
        ));
        assert!(body.has_attachment());
    }

    #[test]
    fn missing_extension_data() {
        let body = structure(r#"("TEXT" "PLAIN" NIL NIL NIL "7BIT" 10 1)"#);
        assert!(!body.has_attachment());
    }

    #[test]
    fn rejects_non_list() {
        assert!(BodyStructure::from_value(&Value::Nil).is_err());
    }
}
