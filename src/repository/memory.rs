//! In-memory job store for tests and single-process runs.
//!
//! Lock-based: every method takes the write (or read) lock for the duration
//! of its check-and-set, which gives the same per-row atomicity the SQL
//! backend gets from conditional `UPDATE` statements.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{check_transition, JobStore, StoreError, StoreResult};
use crate::models::{Classification, DocumentRecord, DocumentStatus, OutputRecord};

const IN_FLIGHT: [DocumentStatus; 2] = [DocumentStatus::Submitted, DocumentStatus::InProgress];

#[derive(Debug, Default)]
struct Tables {
    documents: HashMap<String, DocumentRecord>,
    /// Keyed by document id, then output type.
    outputs: HashMap<String, BTreeMap<String, OutputRecord>>,
}

/// In-memory job store.
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Matching documents, least recently updated first.
    async fn scan(&self, matches: impl Fn(&DocumentRecord) -> bool, limit: usize) -> Vec<DocumentRecord> {
        let tables = self.tables.read().await;
        let mut docs: Vec<DocumentRecord> = tables.documents.values().filter(|d| matches(d)).cloned().collect();
        docs.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        docs.truncate(limit);
        docs
    }

    /// Total number of output records across all documents.
    pub async fn output_count(&self) -> usize {
        let tables = self.tables.read().await;
        tables.outputs.values().map(|m| m.len()).sum()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get_document(&self, document_id: &str) -> StoreResult<Option<DocumentRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.documents.get(document_id).cloned())
    }

    async fn insert_document(&self, document: &DocumentRecord) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        if tables.documents.contains_key(&document.document_id) {
            return Ok(false);
        }
        tables
            .documents
            .insert(document.document_id.clone(), document.clone());
        Ok(true)
    }

    async fn set_classification(
        &self,
        document_id: &str,
        classification: Classification,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let doc = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        if doc.classification.is_some() {
            return Ok(false);
        }
        doc.classification = Some(classification);
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_job_id(&self, document_id: &str, job_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let doc = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        if doc.job_id.is_some() || doc.status != DocumentStatus::Routed {
            return Ok(false);
        }
        doc.job_id = Some(job_id.to_string());
        doc.status = DocumentStatus::Submitted;
        doc.attempts += 1;
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition(
        &self,
        document_id: &str,
        from: &[DocumentStatus],
        to: DocumentStatus,
    ) -> StoreResult<bool> {
        check_transition(from, to)?;
        let mut tables = self.tables.write().await;
        let doc = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        if !from.contains(&doc.status) {
            return Ok(false);
        }
        doc.status = to;
        doc.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_attempt(&self, document_id: &str) -> StoreResult<u32> {
        let mut tables = self.tables.write().await;
        let doc = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        doc.attempts += 1;
        doc.updated_at = Utc::now();
        Ok(doc.attempts)
    }

    async fn request_results(&self, document_id: &str) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let doc = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))?;
        if !IN_FLIGHT.contains(&doc.status) || doc.results_requested_at.is_some() {
            return Ok(false);
        }
        let now = Utc::now();
        doc.status = DocumentStatus::InProgress;
        doc.results_requested_at = Some(now);
        doc.updated_at = now;
        Ok(true)
    }

    async fn find_by_job_id(&self, job_id: &str) -> StoreResult<Option<DocumentRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .values()
            .find(|d| d.job_id.as_deref() == Some(job_id))
            .cloned())
    }

    async fn scan_by_status(
        &self,
        statuses: &[DocumentStatus],
        limit: usize,
    ) -> StoreResult<Vec<DocumentRecord>> {
        Ok(self.scan(|d| statuses.contains(&d.status), limit).await)
    }

    async fn scan_in_flight(
        &self,
        results_requested: bool,
        limit: usize,
    ) -> StoreResult<Vec<DocumentRecord>> {
        Ok(self
            .scan(
                |d| IN_FLIGHT.contains(&d.status) && d.results_requested_at.is_some() == results_requested,
                limit,
            )
            .await)
    }

    async fn put_output(&self, output: &OutputRecord) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .outputs
            .entry(output.document_id.clone())
            .or_default()
            .insert(output.output_type.clone(), output.clone());
        Ok(())
    }

    async fn list_outputs(&self, document_id: &str) -> StoreResult<Vec<OutputRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .outputs
            .get(document_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn count_by_status(&self) -> StoreResult<BTreeMap<DocumentStatus, u64>> {
        let tables = self.tables.read().await;
        let mut counts = BTreeMap::new();
        for doc in tables.documents.values() {
            *counts.entry(doc.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ObjectLocation;

    fn doc(key: &str) -> DocumentRecord {
        DocumentRecord::new(ObjectLocation::new("docs", key), None, 100)
    }

    #[tokio::test]
    async fn test_insert_is_first_writer_wins() {
        let store = InMemoryJobStore::new();
        let d = doc("a.pdf");
        assert!(store.insert_document(&d).await.unwrap());
        assert!(!store.insert_document(&d).await.unwrap());
    }

    #[tokio::test]
    async fn test_classification_is_set_once() {
        let store = InMemoryJobStore::new();
        let d = doc("a.pdf");
        store.insert_document(&d).await.unwrap();

        assert!(store
            .set_classification(&d.document_id, Classification::Async)
            .await
            .unwrap());
        assert!(!store
            .set_classification(&d.document_id, Classification::Sync)
            .await
            .unwrap());

        let loaded = store.get_document(&d.document_id).await.unwrap().unwrap();
        assert_eq!(loaded.classification, Some(Classification::Async));
    }

    #[tokio::test]
    async fn test_job_id_requires_routed_and_is_set_once() {
        let store = InMemoryJobStore::new();
        let d = doc("a.pdf");
        store.insert_document(&d).await.unwrap();

        // Still NEW
        assert!(!store.set_job_id(&d.document_id, "j1").await.unwrap());

        store
            .transition(&d.document_id, &[DocumentStatus::New], DocumentStatus::Routed)
            .await
            .unwrap();
        assert!(store.set_job_id(&d.document_id, "j1").await.unwrap());
        assert!(!store.set_job_id(&d.document_id, "j2").await.unwrap());

        let loaded = store.get_document(&d.document_id).await.unwrap().unwrap();
        assert_eq!(loaded.job_id.as_deref(), Some("j1"));
        assert_eq!(loaded.status, DocumentStatus::Submitted);
        assert_eq!(loaded.attempts, 1);

        let found = store.find_by_job_id("j1").await.unwrap().unwrap();
        assert_eq!(found.document_id, d.document_id);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = InMemoryJobStore::new();
        let d = doc("a.pdf");
        store.insert_document(&d).await.unwrap();

        assert!(store
            .transition(&d.document_id, &[DocumentStatus::New], DocumentStatus::Routed)
            .await
            .unwrap());
        // Second identical attempt loses
        assert!(!store
            .transition(&d.document_id, &[DocumentStatus::New], DocumentStatus::Routed)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_transition_rejects_backward_request() {
        let store = InMemoryJobStore::new();
        let d = doc("a.pdf");
        store.insert_document(&d).await.unwrap();

        let result = store
            .transition(&d.document_id, &[DocumentStatus::InProgress], DocumentStatus::Submitted)
            .await;
        assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_output_upsert_overwrites() {
        let store = InMemoryJobStore::new();
        let first = OutputRecord::new("d1", "page-1-Text", ObjectLocation::new("docs", "v1"));
        let second = OutputRecord::new("d1", "page-1-Text", ObjectLocation::new("docs", "v2"));
        store.put_output(&first).await.unwrap();
        store.put_output(&second).await.unwrap();

        let outputs = store.list_outputs("d1").await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].location.key, "v2");
        assert_eq!(store.output_count().await, 1);
    }

    #[tokio::test]
    async fn test_scan_and_count_by_status() {
        let store = InMemoryJobStore::new();
        for key in ["a.pdf", "b.pdf", "c.png"] {
            store.insert_document(&doc(key)).await.unwrap();
        }
        let a = doc("a.pdf").document_id;
        store
            .transition(&a, &[DocumentStatus::New], DocumentStatus::Routed)
            .await
            .unwrap();

        let new_docs = store.scan_by_status(&[DocumentStatus::New], 10).await.unwrap();
        assert_eq!(new_docs.len(), 2);
        let limited = store.scan_by_status(&[DocumentStatus::New], 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get(&DocumentStatus::New), Some(&2));
        assert_eq!(counts.get(&DocumentStatus::Routed), Some(&1));
    }

    async fn submitted(store: &InMemoryJobStore, key: &str, job_id: &str) -> String {
        let d = doc(key);
        store.insert_document(&d).await.unwrap();
        store
            .transition(&d.document_id, &[DocumentStatus::New], DocumentStatus::Routed)
            .await
            .unwrap();
        store.set_job_id(&d.document_id, job_id).await.unwrap();
        d.document_id
    }

    #[tokio::test]
    async fn test_result_fetch_is_requested_once() {
        let store = InMemoryJobStore::new();
        let id = submitted(&store, "a.pdf", "j1").await;

        assert!(store.request_results(&id).await.unwrap());
        assert!(!store.request_results(&id).await.unwrap());

        let loaded = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::InProgress);
        assert!(loaded.results_requested_at.is_some());

        assert!(store.scan_in_flight(false, 10).await.unwrap().is_empty());
        let waiting = store.scan_in_flight(true, 10).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].document_id, id);
    }

    #[tokio::test]
    async fn test_result_fetch_not_requested_for_unsubmitted_or_final() {
        let store = InMemoryJobStore::new();
        let d = doc("a.png");
        store.insert_document(&d).await.unwrap();
        assert!(!store.request_results(&d.document_id).await.unwrap());

        let failed = submitted(&store, "b.pdf", "j2").await;
        store
            .transition(&failed, &[DocumentStatus::Submitted], DocumentStatus::Failed)
            .await
            .unwrap();
        assert!(!store.request_results(&failed).await.unwrap());
    }

    #[tokio::test]
    async fn test_attempt_moves_document_to_back_of_scan() {
        let store = InMemoryJobStore::new();
        let first = submitted(&store, "a.pdf", "j1").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = submitted(&store, "b.pdf", "j2").await;

        let oldest = store.scan_in_flight(false, 1).await.unwrap();
        assert_eq!(oldest[0].document_id, first);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.record_attempt(&first).await.unwrap();
        let oldest = store.scan_in_flight(false, 1).await.unwrap();
        assert_eq!(oldest[0].document_id, second);
    }

    #[tokio::test]
    async fn test_missing_document_errors() {
        let store = InMemoryJobStore::new();
        let result = store.record_attempt("nope").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
