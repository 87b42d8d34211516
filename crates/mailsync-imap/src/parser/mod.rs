//! Sans-I/O response parser.
//!
//! Input is one response as produced by
//! [`FramedStream::read_response`](crate::connection::FramedStream::read_response),
//! literals included.

mod body_structure;
mod response;
mod value;

pub use body_structure::{BodyStructure, Disposition};
pub use response::{FetchItem, Response, ResponseParser, UntaggedResponse};
pub use value::{Cursor, Value};
