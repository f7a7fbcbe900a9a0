//! Data models for ocrflow.

mod document;
mod message;
mod object;
mod output;

pub use document::{document_id_for, Classification, DocumentRecord, DocumentStatus};
pub use message::{CompletionNotice, JobStatus, QueueMessage};
pub use object::{ObjectCreatedEvent, ObjectLocation};
pub use output::OutputRecord;
