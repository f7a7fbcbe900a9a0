//! Messages exchanged between stages.

use serde::{Deserialize, Serialize};

/// Envelope carried by every work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl QueueMessage {
    pub fn for_document(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            job_id: None,
        }
    }

    pub fn for_job(document_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            job_id: Some(job_id.into()),
        }
    }
}

/// Status of an external analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload published to the completion topic when a job finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub job_id: String,
    pub status: JobStatus,
    /// Document id echoed back from the job tag, when the service supplies it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_tag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_message_wire_format() {
        let json = serde_json::to_string(&QueueMessage::for_document("d1")).unwrap();
        assert_eq!(json, r#"{"documentId":"d1"}"#);

        let json = serde_json::to_string(&QueueMessage::for_job("d1", "j1")).unwrap();
        assert_eq!(json, r#"{"documentId":"d1","jobId":"j1"}"#);
    }

    #[test]
    fn test_completion_notice_parses_without_tag() {
        let notice: CompletionNotice =
            serde_json::from_str(r#"{"jobId":"j1","status":"FAILED"}"#).unwrap();
        assert_eq!(notice.status, JobStatus::Failed);
        assert!(notice.job_tag.is_none());
    }
}
