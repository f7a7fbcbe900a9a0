//! Pipeline stages.
//!
//! Each stage is an idempotent function of its input message and the stored
//! document state. Stages never call one another; they coordinate through
//! the job store and the work queues.

pub mod async_submitter;
pub mod outputs;
pub mod reconciler;
pub mod result_fetcher;
pub mod router;
pub mod sync_analyzer;

pub use async_submitter::AsyncSubmitter;
pub use outputs::OutputGenerator;
pub use reconciler::{PollReport, PollSchedule, ReconcileOutcome, Reconciler, Trigger};
pub use result_fetcher::ResultFetcher;
pub use router::{DocumentRouter, RouteOutcome, RoutingPolicy};
pub use sync_analyzer::SyncAnalyzer;

use thiserror::Error;

use crate::analysis::AnalysisError;
use crate::models::JobStatus;
use crate::repository::StoreError;
use crate::storage::StorageError;
use crate::work_queue::{QueueError, Retryable};

/// Why a stage could not finish a message.
///
/// Returning any of these leaves the message unacknowledged, so it is
/// redelivered until it succeeds or is dead-lettered.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("{0}")]
    Analysis(#[from] AnalysisError),
    #[error("Object storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Document not found: {0}")]
    DocumentNotFound(String),
    #[error("Document {0} has no job id")]
    MissingJobId(String),
    #[error("Job {job_id} reports {status}, expected SUCCEEDED")]
    JobNotReady { job_id: String, status: JobStatus },
    #[error("Fetching results of job {0} exceeded the processing deadline")]
    DeadlineExceeded(String),
    #[error("Could not render outputs: {0}")]
    Output(String),
}

impl StageError {
    /// Whether a redelivery has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            StageError::Analysis(e) => e.is_transient(),
            StageError::Storage(StorageError::Io(_)) => true,
            StageError::Storage(_)
            | StageError::DocumentNotFound(_)
            | StageError::MissingJobId(_)
            | StageError::Output(_) => false,
            StageError::Store(_)
            | StageError::Queue(_)
            | StageError::JobNotReady { .. }
            | StageError::DeadlineExceeded(_) => true,
        }
    }
}

impl Retryable for StageError {
    fn is_transient(&self) -> bool {
        StageError::is_transient(self)
    }
}

impl From<csv::Error> for StageError {
    fn from(e: csv::Error) -> Self {
        StageError::Output(e.to_string())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        StageError::Output(e.to_string())
    }
}
