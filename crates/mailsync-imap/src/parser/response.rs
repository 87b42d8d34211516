//! Response parsing.

use super::body_structure::BodyStructure;
use super::value::{Cursor, Value};
use crate::types::{ResponseCode, Status, Uid};
use crate::{Error, Result};

/// One complete server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Tagged completion of a command.
    Tagged {
        /// Tag of the command.
        tag: String,
        /// Completion status.
        status: Status,
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// Untagged data.
    Untagged(UntaggedResponse),
    /// Continuation request (`+ ...`).
    Continuation(String),
}

/// Untagged server data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedResponse {
    /// `* OK|NO|BAD|PREAUTH|BYE [code] text`
    Status {
        /// Status keyword.
        status: Status,
        /// Optional response code.
        code: Option<ResponseCode>,
        /// Human-readable text.
        text: String,
    },
    /// `* CAPABILITY ...`, uppercased.
    Capability(Vec<String>),
    /// `* SEARCH ...`
    Search(Vec<Uid>),
    /// `* n EXISTS`
    Exists(u32),
    /// `* n EXPUNGE`
    Expunge(u32),
    /// `* n FETCH (...)`
    Fetch {
        /// Message sequence number.
        seq: u32,
        /// Returned data items.
        items: Vec<FetchItem>,
    },
    /// Anything the client does not act on.
    Other(String),
}

/// One data item of a FETCH response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchItem {
    /// `UID n`
    Uid(Uid),
    /// `RFC822.SIZE n`
    Size(u32),
    /// `BODYSTRUCTURE (...)`
    BodyStructure(BodyStructure),
    /// `BODY[section] data`
    Section {
        /// Section spec between the brackets, e.g. `HEADER.FIELDS (SUBJECT)`.
        section: String,
        /// Returned octets, `None` for NIL.
        data: Option<Vec<u8>>,
    },
    /// `FLAGS (...)`
    Flags(Vec<String>),
    /// Any other item.
    Other {
        /// Item name.
        name: String,
        /// Item value.
        value: Value,
    },
}

/// Parser for framed responses.
#[derive(Debug, Clone, Copy)]
pub struct ResponseParser;

impl ResponseParser {
    /// Parses one response produced by the framed reader.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the response is malformed.
    pub fn parse(input: &[u8]) -> Result<Response> {
        let mut cursor = Cursor::new(input);
        match cursor.peek() {
            Some(b'+') => {
                cursor.expect(b'+')?;
                cursor.skip_spaces();
                Ok(Response::Continuation(cursor.rest_of_line()))
            }
            Some(b'*') => {
                cursor.expect(b'*')?;
                cursor.expect(b' ')?;
                parse_untagged(&mut cursor).map(Response::Untagged)
            }
            Some(_) => {
                let tag = cursor.word().to_string();
                cursor.expect(b' ')?;
                let word = cursor.word();
                let status = Status::parse(word)
                    .ok_or_else(|| Error::parse(cursor.position(), format!("bad status {word}")))?;
                let (code, text) = parse_resp_text(&mut cursor)?;
                Ok(Response::Tagged {
                    tag,
                    status,
                    code,
                    text,
                })
            }
            None => Err(Error::parse(0, "empty response")),
        }
    }
}

fn parse_untagged(cursor: &mut Cursor<'_>) -> Result<UntaggedResponse> {
    let word = cursor.word();
    if let Some(status) = Status::parse(word) {
        let (code, text) = parse_resp_text(cursor)?;
        return Ok(UntaggedResponse::Status { status, code, text });
    }

    match word.to_ascii_uppercase().as_str() {
        "CAPABILITY" => {
            cursor.skip_spaces();
            let rest = cursor.rest_of_line();
            Ok(UntaggedResponse::Capability(
                rest.split_ascii_whitespace()
                    .map(str::to_ascii_uppercase)
                    .collect(),
            ))
        }
        "SEARCH" => parse_search(cursor).map(UntaggedResponse::Search),
        upper => match upper.parse::<u32>() {
            Ok(number) => parse_numbered(cursor, number),
            Err(_) => Ok(UntaggedResponse::Other(upper.to_string())),
        },
    }
}

fn parse_search(cursor: &mut Cursor<'_>) -> Result<Vec<Uid>> {
    let mut uids = Vec::new();
    loop {
        cursor.skip_spaces();
        if cursor.at_line_end() {
            return Ok(uids);
        }
        if cursor.peek() == Some(b'(') {
            // ESEARCH-style modifiers such as (MODSEQ 917162500)
            cursor.value()?;
            continue;
        }
        let start = cursor.position();
        let word = cursor.word();
        let n: u32 = word
            .parse()
            .map_err(|_| Error::parse(start, format!("invalid SEARCH result {word}")))?;
        if let Some(uid) = Uid::new(n) {
            uids.push(uid);
        }
    }
}

fn parse_numbered(cursor: &mut Cursor<'_>, number: u32) -> Result<UntaggedResponse> {
    cursor.expect(b' ')?;
    let kind = cursor.word().to_ascii_uppercase();
    match kind.as_str() {
        "EXISTS" => Ok(UntaggedResponse::Exists(number)),
        "EXPUNGE" => Ok(UntaggedResponse::Expunge(number)),
        "FETCH" => {
            cursor.skip_spaces();
            let value = cursor.value()?;
            let items = value
                .as_list()
                .ok_or_else(|| Error::parse(cursor.position(), "FETCH data is not a list"))?;
            Ok(UntaggedResponse::Fetch {
                seq: number,
                items: parse_fetch_items(items)?,
            })
        }
        _ => Ok(UntaggedResponse::Other(kind)),
    }
}

fn parse_fetch_items(values: &[Value]) -> Result<Vec<FetchItem>> {
    let mut items = Vec::with_capacity(values.len() / 2);
    for pair in values.chunks(2) {
        let [name, value] = pair else {
            return Err(Error::parse(0, "FETCH item without value"));
        };
        let name = name
            .as_str()
            .ok_or_else(|| Error::parse(0, "FETCH item name is not an atom"))?;
        let upper = name.to_ascii_uppercase();
        let item = match upper.as_str() {
            "UID" => {
                let uid = value
                    .as_number()
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(Uid::new)
                    .ok_or_else(|| Error::parse(0, "invalid UID"))?;
                FetchItem::Uid(uid)
            }
            "RFC822.SIZE" => FetchItem::Size(
                value
                    .as_number()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| Error::parse(0, "invalid RFC822.SIZE"))?,
            ),
            "BODYSTRUCTURE" => FetchItem::BodyStructure(BodyStructure::from_value(value)?),
            "FLAGS" => FetchItem::Flags(
                value
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|flag| flag.as_str().map(str::to_string))
                    .collect(),
            ),
            _ if upper.starts_with("BODY[") => {
                let section = name
                    .find('[')
                    .zip(name.rfind(']'))
                    .map(|(open, close)| name[open + 1..close].to_string())
                    .unwrap_or_default();
                FetchItem::Section {
                    section,
                    data: value.as_bytes().map(<[u8]>::to_vec),
                }
            }
            _ => FetchItem::Other {
                name: upper,
                value: value.clone(),
            },
        };
        items.push(item);
    }
    Ok(items)
}

fn parse_resp_text(cursor: &mut Cursor<'_>) -> Result<(Option<ResponseCode>, String)> {
    cursor.skip_spaces();
    let code = if cursor.peek() == Some(b'[') {
        cursor.expect(b'[')?;
        let inner = cursor.until(b']')?;
        cursor.skip_spaces();
        Some(ResponseCode::parse(inner))
    } else {
        None
    };
    Ok((code, cursor.rest_of_line()))
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

    fn uid(n: u32) -> Uid {
        Uid::new(n).unwrap()
    }

    #[test]
    fn tagged_ok_with_code() {
        let parsed = ResponseParser::parse(b"A0003 OK [READ-WRITE] SELECT completed\r\n").unwrap();
        assert_eq!(
            parsed,
            Response::Tagged {
                tag: "A0003".into(),
                status: Status::Ok,
                code: Some(ResponseCode::ReadWrite),
                text: "SELECT completed".into(),
            }
        );
    }

    #[test]
    fn tagged_no_nonexistent() {
        let parsed =
            ResponseParser::parse(b"A0009 NO [NONEXISTENT] No such message\r\n").unwrap();
        let Response::Tagged { status, code, .. } = parsed else {
            panic!("expected tagged");
        };
        assert_eq!(status, Status::No);
        assert_eq!(code, Some(ResponseCode::NonExistent));
    }

    #[test]
    fn untagged_bye() {
        let parsed = ResponseParser::parse(b"* BYE Autologout; idle for too long\r\n").unwrap();
        assert_eq!(
            parsed,
            Response::Untagged(UntaggedResponse::Status {
                status: Status::Bye,
                code: None,
                text: "Autologout; idle for too long".into(),
            })
        );
    }

    #[test]
    fn capability_list() {
        let parsed = ResponseParser::parse(b"* CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN\r\n").unwrap();
        assert_eq!(
            parsed,
            Response::Untagged(UntaggedResponse::Capability(vec![
                "IMAP4REV1".into(),
                "STARTTLS".into(),
                "AUTH=PLAIN".into()
            ]))
        );
    }

    #[test]
    fn search_results() {
        let parsed = ResponseParser::parse(b"* SEARCH 101 102 103\r\n").unwrap();
        assert_eq!(
            parsed,
            Response::Untagged(UntaggedResponse::Search(vec![uid(101), uid(102), uid(103)]))
        );
        let empty = ResponseParser::parse(b"* SEARCH\r\n").unwrap();
        assert_eq!(empty, Response::Untagged(UntaggedResponse::Search(vec![])));
        let modseq = ResponseParser::parse(b"* SEARCH 2 5 (MODSEQ 917162500)\r\n").unwrap();
        assert_eq!(
            modseq,
            Response::Untagged(UntaggedResponse::Search(vec![uid(2), uid(5)]))
        );
    }

    #[test]
    fn exists_and_expunge() {
        assert_eq!(
            ResponseParser::parse(b"* 172 EXISTS\r\n").unwrap(),
            Response::Untagged(UntaggedResponse::Exists(172))
        );
        assert_eq!(
            ResponseParser::parse(b"* 3 EXPUNGE\r\n").unwrap(),
            Response::Untagged(UntaggedResponse::Expunge(3))
        );
    }

    #[test]
    fn fetch_summary() {
        let input = concat!(
            "* 12 FETCH (UID 101 RFC822.SIZE 2048 BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 20 1 NIL NIL NIL NIL) ",
            "BODY[HEADER.FIELDS (SUBJECT FROM DATE)] {20}\r\n",
            "Subject: Invoice\r\n\r\n",
            ")\r\n"
        );
        let Response::Untagged(UntaggedResponse::Fetch { seq, items }) =
            ResponseParser::parse(input.as_bytes()).unwrap()
        else {
            panic!("expected fetch");
        };
        assert_eq!(seq, 12);
        assert_eq!(items[0], FetchItem::Uid(uid(101)));
        assert_eq!(items[1], FetchItem::Size(2048));
        assert!(matches!(items[2], FetchItem::BodyStructure(_)));
        assert_eq!(
            items[3],
            FetchItem::Section {
                section: "HEADER.FIELDS (SUBJECT FROM DATE)".into(),
                data: Some(b"Subject: Invoice\r\n\r\n".to_vec()),
            }
        );
    }

    #[test]
    fn fetch_nil_body() {
        let Response::Untagged(UntaggedResponse::Fetch { items, .. }) =
            ResponseParser::parse(b"* 1 FETCH (UID 5 BODY[] NIL)\r\n").unwrap()
        else {
            panic!("expected fetch");
        };
        assert_eq!(
            items[1],
            FetchItem::Section {
                section: String::new(),
                data: None
            }
        );
    }

    #[test]
    fn continuation() {
        assert_eq!(
            ResponseParser::parse(b"+ Ready for literal\r\n").unwrap(),
            Response::Continuation("Ready for literal".into())
        );
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = ResponseParser::parse(b"A1 MAYBE done\r\n").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolState);
        assert!(ResponseParser::parse(b"").is_err());
        assert!(ResponseParser::parse(b"* 4 FETCH (UID)\r\n").is_err());
    }
}
