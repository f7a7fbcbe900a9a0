//! Output records: one per (document, output type).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ObjectLocation;

/// A persisted analysis artifact.
///
/// Keyed by `(document_id, output_type)`; writing the same key again
/// overwrites the previous record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub document_id: String,
    /// e.g. `Response`, `page-1-Text`, `page-2-Tables`.
    pub output_type: String,
    pub location: ObjectLocation,
    pub written_at: DateTime<Utc>,
}

impl OutputRecord {
    pub fn new(document_id: &str, output_type: impl Into<String>, location: ObjectLocation) -> Self {
        Self {
            document_id: document_id.to_string(),
            output_type: output_type.into(),
            location,
            written_at: Utc::now(),
        }
    }

    /// The composite primary key.
    pub fn key(&self) -> (&str, &str) {
        (&self.document_id, &self.output_type)
    }
}
