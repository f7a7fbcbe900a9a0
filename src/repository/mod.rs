//! Job store: document and output persistence.
//!
//! Every stage coordinates exclusively through this interface. All writes are
//! single-row and conditional on the row's current state, so no stage needs a
//! lock or a multi-row transaction to stay correct under redelivery and
//! racing triggers.

pub mod diesel_job_store;
pub mod diesel_models;
pub mod diesel_pool;
pub mod memory;

pub use diesel_job_store::DieselJobStore;
pub use diesel_pool::{AsyncSqlitePool, DieselError};
pub use memory::InMemoryJobStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Classification, DocumentRecord, DocumentStatus, OutputRecord};

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from job store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DieselError),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Illegal status transition {from} -> {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },
    #[error("Corrupt record for {document_id}: {reason}")]
    Corrupt { document_id: String, reason: String },
}

/// Storage abstraction shared by every pipeline stage.
///
/// Implementations must make each method atomic with respect to the single
/// row it touches.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fetch a document by id.
    async fn get_document(&self, document_id: &str) -> StoreResult<Option<DocumentRecord>>;

    /// Insert a document unless one with the same id already exists.
    ///
    /// Returns `true` when the record was created.
    async fn insert_document(&self, document: &DocumentRecord) -> StoreResult<bool>;

    /// Set the classification if none is stored yet.
    ///
    /// Returns `true` when this call assigned it.
    async fn set_classification(
        &self,
        document_id: &str,
        classification: Classification,
    ) -> StoreResult<bool>;

    /// Record the external job id and move `ROUTED -> SUBMITTED`.
    ///
    /// Succeeds only while no job id is stored and the document is `ROUTED`.
    /// Also counts one submission attempt.
    async fn set_job_id(&self, document_id: &str, job_id: &str) -> StoreResult<bool>;

    /// Compare-and-swap on status: move to `to` only if the current status is
    /// one of `from`.
    ///
    /// Returns `true` when the transition happened. Every `from` must be able
    /// to advance to `to`; anything else is a programming error reported as
    /// [`StoreError::InvalidTransition`].
    async fn transition(
        &self,
        document_id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> StoreResult<bool>;

    /// Increment the attempt counter and touch `updated_at`, returning the
    /// new count.
    ///
    /// Touching the row sends it to the back of [`Self::scan_in_flight`], so
    /// a limited poll scan rotates through every in-flight job.
    async fn record_attempt(&self, document_id: &str) -> StoreResult<u32>;

    /// Claim the result fetch of a finished job.
    ///
    /// Succeeds once per document: only while it is `SUBMITTED` or
    /// `IN_PROGRESS` and no fetch was requested before. Moves the document to
    /// `IN_PROGRESS` and stamps `results_requested_at`. Returns `true` for the
    /// single caller that should enqueue the results message.
    async fn request_results(&self, document_id: &str) -> StoreResult<bool>;

    /// Resolve a document by its external job id.
    async fn find_by_job_id(&self, job_id: &str) -> StoreResult<Option<DocumentRecord>>;

    /// Documents in any of `statuses`, least recently updated first.
    async fn scan_by_status(
        &self,
        statuses: &[DocumentStatus],
        limit: usize,
    ) -> StoreResult<Vec<DocumentRecord>>;

    /// Async documents still `SUBMITTED` or `IN_PROGRESS`, least recently
    /// updated first.
    ///
    /// With `results_requested` false these are jobs whose completion has not
    /// been observed yet; with it true, finished jobs waiting on their result
    /// fetch.
    async fn scan_in_flight(
        &self,
        results_requested: bool,
        limit: usize,
    ) -> StoreResult<Vec<DocumentRecord>>;

    /// Upsert an output record by `(document_id, output_type)`.
    async fn put_output(&self, output: &OutputRecord) -> StoreResult<()>;

    /// All outputs of a document, ordered by output type.
    async fn list_outputs(&self, document_id: &str) -> StoreResult<Vec<OutputRecord>>;

    /// Number of documents per status.
    async fn count_by_status(&self) -> StoreResult<BTreeMap<DocumentStatus, u64>>;
}

/// Reject transition requests that could move a document backwards.
pub(crate) fn check_transition(from: &[DocumentStatus], to: DocumentStatus) -> StoreResult<()> {
    match from.iter().find(|f| !f.can_advance_to(to)) {
        Some(bad) => Err(StoreError::InvalidTransition { from: *bad, to }),
        None => Ok(()),
    }
}

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transition_rejects_backwards() {
        assert!(check_transition(&[DocumentStatus::Submitted, DocumentStatus::InProgress], DocumentStatus::Succeeded).is_ok());
        let err = check_transition(&[DocumentStatus::Succeeded], DocumentStatus::Failed).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: DocumentStatus::Succeeded,
                to: DocumentStatus::Failed
            }
        ));
    }

    #[test]
    fn test_parse_datetime_falls_back_to_epoch() {
        assert_eq!(parse_datetime("garbage"), DateTime::UNIX_EPOCH);
        let now = Utc::now();
        let parsed = parse_datetime(&now.to_rfc3339());
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
