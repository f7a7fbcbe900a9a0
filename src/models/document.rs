//! Document records tracked by the job store.
//!
//! A document is created once per object in the content bucket and then
//! advanced strictly forward through [`DocumentStatus`] by each stage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ObjectLocation;

/// Length of the hex prefix used as a document identifier.
const DOCUMENT_ID_LEN: usize = 32;

/// Processing status of a document.
///
/// Variants are declared in lifecycle order; `Ord` follows that order and is
/// what the store uses to reject backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    New,
    Routed,
    Submitted,
    InProgress,
    Succeeded,
    Failed,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 6] = [
        Self::New,
        Self::Routed,
        Self::Submitted,
        Self::InProgress,
        Self::Succeeded,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Routed => "ROUTED",
            Self::Submitted => "SUBMITTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "ROUTED" => Some(Self::Routed),
            "SUBMITTED" => Some(Self::Submitted),
            "IN_PROGRESS" => Some(Self::InProgress),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// `SUCCEEDED` and `FAILED` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle.
    ///
    /// The two terminal states are siblings, so neither may follow the other.
    pub fn can_advance_to(&self, next: DocumentStatus) -> bool {
        !self.is_terminal() && next > *self
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which analysis path a document takes. Assigned once by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Sync,
    Async,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "SYNC",
            Self::Async => "ASYNC",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SYNC" => Some(Self::Sync),
            "ASYNC" => Some(Self::Async),
            _ => None,
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingested document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRecord {
    pub document_id: String,
    /// Where the source object lives. Referenced, never copied.
    pub object_location: ObjectLocation,
    /// Content type reported by the create event or guessed from the key.
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub classification: Option<Classification>,
    /// External analysis job handle, `ASYNC` documents only.
    pub job_id: Option<String>,
    pub status: DocumentStatus,
    /// Submission, analysis and polling attempts.
    pub attempts: u32,
    /// Set once, when the finished job's result fetch was queued. The
    /// document stays `IN_PROGRESS` until the fetch stores its outputs.
    #[serde(default)]
    pub results_requested_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Create a fresh `NEW` record for an object.
    pub fn new(object_location: ObjectLocation, content_type: Option<String>, size_bytes: u64) -> Self {
        let now = Utc::now();
        Self {
            document_id: document_id_for(&object_location),
            object_location,
            content_type,
            size_bytes,
            classification: None,
            job_id: None,
            status: DocumentStatus::New,
            attempts: 0,
            results_requested_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Derive the stable document identifier for an object location.
///
/// Duplicate create notifications for the same object yield the same id.
pub fn document_id_for(location: &ObjectLocation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(location.bucket.as_bytes());
    hasher.update(b"/");
    hasher.update(location.key.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(DOCUMENT_ID_LEN);
    id
}
