//! Flattening of parsed messages.
//!
//! `mailparse` does the decoding. This module turns its tree into a small
//! tagged tree of [`Part`]s, walking at most [`MAX_DEPTH`] levels, and then
//! flattens that into text, HTML and a list of attachments.

use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use tracing::warn;

use crate::Result;

/// Deepest multipart nesting that is walked.
pub const MAX_DEPTH: usize = 16;

/// One decoded attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentData {
    /// File name, generated when the message names none.
    pub filename: String,
    /// MIME type.
    pub mime_type: String,
    /// Decoded bytes.
    pub bytes: Vec<u8>,
}

/// A node of the message tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    /// `text/*` other than HTML.
    Text(String),
    /// `text/html`.
    Html(String),
    /// Container with its children in order.
    Multipart(Vec<Part>),
    /// Anything meant to be saved rather than read.
    Attachment(AttachmentData),
}

/// A message reduced to what the sync engine stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Decoded subject.
    pub subject: String,
    /// Decoded `From` header.
    pub from: String,
    /// Parsed `Date` header.
    pub date: Option<DateTime<Utc>>,
    /// Text parts joined in order.
    pub text: String,
    /// HTML parts joined in order.
    pub html: String,
    /// Attachments in order.
    pub attachments: Vec<AttachmentData>,
}

/// Summary headers of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSummary {
    /// Decoded subject.
    pub subject: String,
    /// Decoded `From` header.
    pub from: String,
    /// Parsed `Date` header.
    pub date: Option<DateTime<Utc>>,
}

/// Parses and flattens a complete RFC 822 message.
///
/// # Errors
///
/// Returns [`Error::Mime`](crate::Error::Mime) if the top-level structure
/// cannot be parsed. Broken nested parts are skipped with a warning.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(raw)?;
    let headers = summary_from(&mail.headers);

    let mut parsed = ParsedMessage {
        subject: headers.subject,
        from: headers.from,
        date: headers.date,
        ..ParsedMessage::default()
    };
    let mut unnamed = 0;
    if let Some(tree) = build(&mail, 0, &mut unnamed) {
        flatten(tree, &mut parsed);
    }
    Ok(parsed)
}

/// Decodes a block of header lines such as a `HEADER.FIELDS` fetch.
///
/// # Errors
///
/// Returns [`Error::Mime`](crate::Error::Mime) if the block is malformed.
pub fn parse_headers(raw: &[u8]) -> Result<HeaderSummary> {
    let (headers, _) = mailparse::parse_headers(raw)?;
    Ok(summary_from(&headers))
}

fn summary_from(headers: &[mailparse::MailHeader<'_>]) -> HeaderSummary {
    HeaderSummary {
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: headers.get_first_value("From").unwrap_or_default(),
        date: headers.get_first_value("Date").as_deref().and_then(parse_date),
    }
}

/// Strict RFC 2822 first, then `mailparse`'s lenient parser. The lenient
/// parser answers 0 for text it cannot read at all, which counts as no date.
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value.trim()) {
        return Some(date.with_timezone(&Utc));
    }
    mailparse::dateparse(value)
        .ok()
        .filter(|secs| *secs != 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn build(mail: &ParsedMail<'_>, depth: usize, unnamed: &mut usize) -> Option<Part> {
    if depth > MAX_DEPTH {
        warn!(depth, mime = %mail.ctype.mimetype, "part nested too deeply, dropped");
        return None;
    }

    let mime = mail.ctype.mimetype.to_ascii_lowercase();
    if mime.starts_with("multipart/") {
        let children = mail
            .subparts
            .iter()
            .filter_map(|sub| build(sub, depth + 1, unnamed))
            .collect();
        return Some(Part::Multipart(children));
    }

    let disposition = mail.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| mail.ctype.params.get("name"))
        .cloned();
    let is_text = mime.starts_with("text/");
    // A missing Content-Disposition reads as inline.
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || !is_text
        || filename.is_some();

    if is_attachment {
        let bytes = match mail.get_body_raw() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(mime = %mime, error = %e, "undecodable attachment skipped");
                return None;
            }
        };
        let filename = filename.unwrap_or_else(|| {
            *unnamed += 1;
            default_filename(&mime, *unnamed)
        });
        return Some(Part::Attachment(AttachmentData {
            filename,
            mime_type: mime,
            bytes,
        }));
    }

    match mail.get_body() {
        Ok(body) if mime == "text/html" => Some(Part::Html(body)),
        Ok(body) => Some(Part::Text(body)),
        Err(e) => {
            warn!(mime = %mime, error = %e, "undecodable text part skipped");
            None
        }
    }
}

fn default_filename(mime: &str, n: usize) -> String {
    let ext = match mime {
        "message/rfc822" => "eml",
        "application/pdf" => "pdf",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "text/calendar" => "ics",
        _ => "bin",
    };
    format!("attachment-{n}.{ext}")
}

fn flatten(part: Part, out: &mut ParsedMessage) {
    match part {
        Part::Text(text) => append(&mut out.text, &text),
        Part::Html(html) => append(&mut out.html, &html),
        Part::Attachment(attachment) => out.attachments.push(attachment),
        Part::Multipart(children) => {
            for child in children {
                flatten(child, out);
            }
        }
    }
}

fn append(body: &mut String, part: &str) {
    if part.trim().is_empty() {
        return;
    }
    if !body.is_empty() {
        body.push('\n');
    }
    body.push_str(part);
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

    const SIMPLE: &[u8] = b"From: Alice <alice@example.org>\r\n\
Subject: =?UTF-8?B?SGVsbG8gV29ybGQ=?=\r\n\
Date: Fri, 01 Mar 2024 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hi there\r\n";

    #[test]
    fn simple_text_message() {
        let parsed = parse_message(SIMPLE).unwrap();
        assert_eq!(parsed.subject, "Hello World");
        assert_eq!(parsed.from, "Alice <alice@example.org>");
        assert_eq!(
            parsed.date.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );
        assert_eq!(parsed.text.trim(), "Hi there");
        assert!(parsed.html.is_empty());
        assert!(parsed.attachments.is_empty());
    }

    #[test]
    fn multipart_with_attachment() {
        let raw = b"Subject: report\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain\r\n\
\r\n\
plain body\r\n\
--inner\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>html body</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0=\r\n\
--outer--\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.text.trim(), "plain body");
        assert_eq!(parsed.html.trim(), "<p>html body</p>");
        assert_eq!(parsed.attachments.len(), 1);
        let attachment = &parsed.attachments[0];
        assert_eq!(attachment.filename, "report.pdf");
        assert_eq!(attachment.mime_type, "application/pdf");
        assert_eq!(attachment.bytes, b"%PDF-");
    }

    #[test]
    fn inline_image_without_name_is_attachment() {
        let raw = b"Content-Type: multipart/related; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/html\r\n\
\r\n\
<img src=\"cid:x\">\r\n\
--b\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw==\r\n\
--b--\r\n";
        let parsed = parse_message(raw).unwrap();
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "attachment-1.png");
    }

    /// A message whose text leaf sits `levels` multiparts deep, each one
    /// inside its parent's body.
    fn nested(levels: usize) -> String {
        fn part(level: usize, levels: usize) -> String {
            if level == levels {
                return "Content-Type: text/plain\r\n\r\nburied\r\n".to_string();
            }
            let boundary = format!("level{level:03}x");
            format!(
                "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n\
                 --{boundary}\r\n{}--{boundary}--\r\n",
                part(level + 1, levels)
            )
        }
        format!("Subject: deep\r\n{}", part(0, levels))
    }

    #[test]
    fn nesting_within_limit_is_kept() {
        let parsed = parse_message(nested(MAX_DEPTH).as_bytes()).unwrap();
        assert_eq!(parsed.text.trim(), "buried");
    }

    #[test]
    fn nesting_beyond_limit_is_dropped() {
        let parsed = parse_message(nested(MAX_DEPTH + 3).as_bytes()).unwrap();
        assert_eq!(parsed.subject, "deep");
        assert!(!parsed.text.contains("buried"));
        assert!(parsed.text.is_empty());
    }

    #[test]
    fn summary_headers() {
        let header = b"Subject: Quarterly numbers\r\n\
From: =?UTF-8?Q?Bj=C3=B6rn?= <bjorn@example.org>\r\n\
Date: not a date\r\n\
\r\n";
        let summary = parse_headers(header).unwrap();
        assert_eq!(summary.subject, "Quarterly numbers");
        assert_eq!(summary.from, "Björn <bjorn@example.org>");
        assert_eq!(summary.date, None);
    }

    #[test]
    fn dates_are_normalized_to_utc() {
        let strict = parse_headers(b"Date: Fri, 01 Mar 2024 10:00:00 +0100\r\n\r\n").unwrap();
        assert_eq!(
            strict.date.unwrap().to_rfc3339(),
            "2024-03-01T09:00:00+00:00"
        );

        // No weekday, zone by name.
        let lenient = parse_headers(b"Date: 1 Mar 2024 10:00:00 GMT\r\n\r\n").unwrap();
        assert_eq!(
            lenient.date.unwrap().to_rfc3339(),
            "2024-03-01T10:00:00+00:00"
        );

        let garbage = parse_headers(b"Date: sometime last week\r\n\r\n").unwrap();
        assert_eq!(garbage.date, None);
    }
}
