//! Message records and their processing state.

mod model;

pub use model::{
    AttachmentRecord, FetchedContent, MessageId, MessageRecord, MessageStatus, MessageSummary,
    StatusCounts, StoredContent,
};
