//! Document analysis service: the OCR collaborator behind both paths.
//!
//! The synchronous path calls [`AnalysisService::analyze`] and waits. The
//! asynchronous path starts a job, learns of its completion through the
//! completion topic or by polling, and then reads the result page by page.

pub mod http;
pub mod local;

pub use http::{HttpAnalysisService, HttpServiceConfig};
pub use local::{LocalAnalysisService, LocalServiceConfig, ServiceStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{JobStatus, ObjectLocation};
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis service throttled the request: {0}")]
    Throttled(String),
    #[error("Analysis request timed out")]
    Timeout,
    #[error("Document rejected by analysis service: {0}")]
    InvalidDocument(String),
    #[error("Unknown analysis job: {0}")]
    JobNotFound(String),
    #[error("Analysis service error: {0}")]
    Service(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AnalysisError {
    /// Whether retrying the same request later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            AnalysisError::Throttled(_) | AnalysisError::Timeout | AnalysisError::Service(_) => true,
            AnalysisError::Http(e) => !e.is_status() || e.status().is_some_and(|s| s.is_server_error()),
            AnalysisError::Storage(StorageError::Io(_)) => true,
            AnalysisError::Storage(_)
            | AnalysisError::InvalidDocument(_)
            | AnalysisError::JobNotFound(_) => false,
        }
    }
}

/// Which extractions to run besides plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSet {
    pub forms: bool,
    pub tables: bool,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            forms: true,
            tables: true,
        }
    }
}

/// Where the service should announce job completion, and the role it may
/// assume to publish there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationChannel {
    pub topic: String,
    pub publisher_role: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartJobRequest {
    pub document: ObjectLocation,
    pub features: FeatureSet,
    /// Echoed back in the completion notice; always the document id.
    pub job_tag: String,
    pub notification_channel: NotificationChannel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Table {
    pub rows: Vec<Vec<String>>,
}

/// Everything extracted from one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageAnalysis {
    /// 1-based.
    pub page_number: u32,
    #[serde(default)]
    pub lines: Vec<String>,
    #[serde(default)]
    pub key_values: Vec<KeyValue>,
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl PageAnalysis {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Complete analysis of a document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub pages: Vec<PageAnalysis>,
}

impl AnalysisOutput {
    /// Assemble pages received across several result pages.
    ///
    /// Pages are ordered by page number; a page number seen twice keeps its
    /// last occurrence.
    pub fn from_pages(pages: impl IntoIterator<Item = PageAnalysis>) -> Self {
        let mut by_number = std::collections::BTreeMap::new();
        for page in pages {
            by_number.insert(page.page_number, page);
        }
        Self {
            pages: by_number.into_values().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// One page of an asynchronous job's result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPage {
    pub pages: Vec<PageAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Analyze a document and wait for the result.
    async fn analyze(
        &self,
        document: &ObjectLocation,
        features: FeatureSet,
    ) -> Result<AnalysisOutput, AnalysisError>;

    /// Start an asynchronous job, returning its id.
    async fn start_job(&self, request: &StartJobRequest) -> Result<String, AnalysisError>;

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, AnalysisError>;

    /// One page of a finished job's result; pass the previous page's
    /// `next_token` to continue.
    async fn get_job_result(
        &self,
        job_id: &str,
        page_token: Option<&str>,
    ) -> Result<ResultPage, AnalysisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(n: u32, line: &str) -> PageAnalysis {
        PageAnalysis {
            page_number: n,
            lines: vec![line.to_string()],
            key_values: Vec::new(),
            tables: Vec::new(),
        }
    }

    #[test]
    fn test_from_pages_orders_and_dedupes() {
        let output = AnalysisOutput::from_pages(vec![page(2, "b"), page(1, "a"), page(2, "b2")]);
        let numbers: Vec<u32> = output.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(output.pages[1].text(), "b2");
    }

    #[test]
    fn test_feature_set_defaults_on() {
        let features: FeatureSet = serde_json::from_str("{}").unwrap();
        assert!(features.forms && features.tables);
    }

    #[test]
    fn test_transient_classification() {
        assert!(AnalysisError::Throttled("slow down".into()).is_transient());
        assert!(AnalysisError::Timeout.is_transient());
        assert!(!AnalysisError::InvalidDocument("bad".into()).is_transient());
        assert!(!AnalysisError::JobNotFound("j1".into()).is_transient());
    }
}
