//! Result fetcher: pulls a finished job's output and persists it.
//!
//! This is the only stage that marks an async document `SUCCEEDED`, and it
//! does so after every output is written. A results message that ends up
//! dead-lettered leaves the document `IN_PROGRESS`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::analysis::{AnalysisError, AnalysisOutput, AnalysisService};
use crate::models::{DocumentStatus, JobStatus, QueueMessage};
use crate::repository::JobStore;
use crate::work_queue::MessageHandler;

use super::{OutputGenerator, StageError};

pub struct ResultFetcher {
    store: Arc<dyn JobStore>,
    analysis: Arc<dyn AnalysisService>,
    outputs: OutputGenerator,
    /// Time allowed to walk every result page. Kept below the results
    /// queue's visibility window.
    fetch_budget: Duration,
}

impl ResultFetcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        analysis: Arc<dyn AnalysisService>,
        outputs: OutputGenerator,
        fetch_budget: Duration,
    ) -> Self {
        Self {
            store,
            analysis,
            outputs,
            fetch_budget,
        }
    }

    /// Follow `next_token` until the last page and merge everything.
    pub async fn fetch_all(&self, job_id: &str) -> Result<AnalysisOutput, AnalysisError> {
        let mut pages = Vec::new();
        let mut seen_tokens = HashSet::new();
        let mut token: Option<String> = None;
        let mut requests = 0usize;

        loop {
            let page = self.analysis.get_job_result(job_id, token.as_deref()).await?;
            requests += 1;
            pages.extend(page.pages);
            match page.next_token {
                Some(next) => {
                    if !seen_tokens.insert(next.clone()) {
                        return Err(AnalysisError::Service(format!(
                            "job {} repeated page token {:?}",
                            job_id, next
                        )));
                    }
                    token = Some(next);
                }
                None => break,
            }
        }

        tracing::debug!("Fetched job {} in {} requests", job_id, requests);
        Ok(AnalysisOutput::from_pages(pages))
    }
}

#[async_trait]
impl MessageHandler for ResultFetcher {
    type Error = StageError;

    fn stage(&self) -> &str {
        "result-fetcher"
    }

    async fn handle(&self, message: &QueueMessage, _receive_count: u32) -> Result<(), StageError> {
        let id = &message.document_id;
        let doc = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| StageError::DocumentNotFound(id.clone()))?;

        let job_id = match (&message.job_id, &doc.job_id) {
            (Some(from_message), Some(stored)) if from_message != stored => {
                tracing::warn!("Result message for {} names job {}, stored job is {}; dropping", id, from_message, stored);
                return Ok(());
            }
            (_, Some(stored)) => stored.clone(),
            (_, None) => return Err(StageError::MissingJobId(id.clone())),
        };
        if doc.status == DocumentStatus::Failed {
            tracing::debug!("{} failed; no results to fetch", id);
            return Ok(());
        }

        let status = self.analysis.get_job_status(&job_id).await?;
        if status != JobStatus::Succeeded {
            return Err(StageError::JobNotReady { job_id, status });
        }

        let output = tokio::time::timeout(self.fetch_budget, self.fetch_all(&job_id))
            .await
            .map_err(|_| StageError::DeadlineExceeded(job_id.clone()))??;
        self.outputs.write(&doc, &output).await?;

        let from = [DocumentStatus::Submitted, DocumentStatus::InProgress];
        if self.store.transition(id, &from, DocumentStatus::Succeeded).await? {
            tracing::info!("{} job {} results stored", id, job_id);
        } else {
            tracing::debug!("{} job {} results stored; status already final", id, job_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{FeatureSet, LocalAnalysisService, LocalServiceConfig, NotificationChannel, StartJobRequest};
    use crate::models::{Classification, DocumentRecord, ObjectLocation};
    use crate::repository::InMemoryJobStore;
    use crate::storage::{InMemoryObjectStore, ObjectStore};

    const THREE_PAGES: &str = "One: 1\u{000C}Two: 2\u{000C}Three: 3";

    struct Fixture {
        store: InMemoryJobStore,
        service: LocalAnalysisService,
        fetcher: ResultFetcher,
        doc_id: String,
        job_id: String,
    }

    async fn fixture() -> Fixture {
        let objects = InMemoryObjectStore::new();
        let loc = ObjectLocation::new("docs", "long.pdf");
        objects.put(&loc, THREE_PAGES.as_bytes().to_vec(), None).await.unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(objects);

        let service = LocalAnalysisService::new(
            objects.clone(),
            None,
            LocalServiceConfig {
                job_duration: None,
                result_page_size: 1,
                ..Default::default()
            },
        );
        let store = InMemoryJobStore::new();
        let mut doc = DocumentRecord::new(loc.clone(), Some("application/pdf".into()), 20);
        doc.classification = Some(Classification::Async);
        doc.status = DocumentStatus::Routed;
        store.insert_document(&doc).await.unwrap();

        let job_id = service
            .start_job(&StartJobRequest {
                document: loc,
                features: FeatureSet::default(),
                job_tag: doc.document_id.clone(),
                notification_channel: NotificationChannel {
                    topic: "completions".into(),
                    publisher_role: "publisher".into(),
                },
            })
            .await
            .unwrap();
        store.set_job_id(&doc.document_id, &job_id).await.unwrap();

        let outputs = OutputGenerator::new(objects, Arc::new(store.clone()), FeatureSet::default());
        let fetcher = ResultFetcher::new(
            Arc::new(store.clone()),
            Arc::new(service.clone()),
            outputs,
            Duration::from_secs(60),
        );
        Fixture {
            store,
            service,
            fetcher,
            doc_id: doc.document_id,
            job_id,
        }
    }

    #[tokio::test]
    async fn test_pages_are_merged_across_result_pages() {
        let f = fixture().await;
        f.service.finish_job(&f.job_id, JobStatus::Succeeded, false).await.unwrap();

        let output = f.fetcher.fetch_all(&f.job_id).await.unwrap();
        let numbers: Vec<u32> = output.pages.iter().map(|p| p.page_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(f.service.stats().result_calls, 3);
    }

    #[tokio::test]
    async fn test_fetch_writes_outputs_idempotently() {
        let f = fixture().await;
        f.service.finish_job(&f.job_id, JobStatus::Succeeded, false).await.unwrap();
        let msg = QueueMessage::for_job(&f.doc_id, &f.job_id);

        f.fetcher.handle(&msg, 1).await.unwrap();
        let first = f.store.list_outputs(&f.doc_id).await.unwrap();
        // Response + 4 per page
        assert_eq!(first.len(), 13);

        f.fetcher.handle(&msg, 1).await.unwrap();
        assert_eq!(f.store.list_outputs(&f.doc_id).await.unwrap().len(), 13);
        assert_eq!(f.store.output_count().await, 13);

        let doc = f.store.get_document(&f.doc_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_job_not_finished_is_retryable() {
        let f = fixture().await;
        let msg = QueueMessage::for_job(&f.doc_id, &f.job_id);

        let err = f.fetcher.handle(&msg, 1).await.unwrap_err();
        assert!(matches!(err, StageError::JobNotReady { status: JobStatus::InProgress, .. }));
        assert!(err.is_transient());
        assert_eq!(f.store.output_count().await, 0);
    }

    #[tokio::test]
    async fn test_claimed_document_succeeds_only_after_outputs() {
        let f = fixture().await;
        f.service.finish_job(&f.job_id, JobStatus::Succeeded, false).await.unwrap();
        assert!(f.store.request_results(&f.doc_id).await.unwrap());
        let msg = QueueMessage::for_job(&f.doc_id, &f.job_id);

        let doc = f.store.get_document(&f.doc_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::InProgress);
        assert_eq!(f.store.output_count().await, 0);

        f.fetcher.handle(&msg, 1).await.unwrap();
        let doc = f.store.get_document(&f.doc_id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Succeeded);
        assert_eq!(f.store.output_count().await, 13);
    }

    #[tokio::test]
    async fn test_unreadable_result_leaves_document_in_progress() {
        let objects = InMemoryObjectStore::new();
        let loc = ObjectLocation::new("docs", "garbled.pdf");
        objects.put(&loc, vec![0xff, 0xfe, 0x00], None).await.unwrap();
        let objects: Arc<dyn ObjectStore> = Arc::new(objects);
        let service = LocalAnalysisService::new(
            objects.clone(),
            None,
            LocalServiceConfig {
                job_duration: None,
                ..Default::default()
            },
        );
        let store = InMemoryJobStore::new();
        let mut doc = DocumentRecord::new(loc.clone(), Some("application/pdf".into()), 3);
        doc.classification = Some(Classification::Async);
        doc.status = DocumentStatus::Routed;
        store.insert_document(&doc).await.unwrap();
        let job_id = service
            .start_job(&StartJobRequest {
                document: loc,
                features: FeatureSet::default(),
                job_tag: doc.document_id.clone(),
                notification_channel: NotificationChannel {
                    topic: "completions".into(),
                    publisher_role: "publisher".into(),
                },
            })
            .await
            .unwrap();
        store.set_job_id(&doc.document_id, &job_id).await.unwrap();
        service.finish_job(&job_id, JobStatus::Succeeded, false).await.unwrap();
        store.request_results(&doc.document_id).await.unwrap();

        let fetcher = ResultFetcher::new(
            Arc::new(store.clone()),
            Arc::new(service.clone()),
            OutputGenerator::new(objects, Arc::new(store.clone()), FeatureSet::default()),
            Duration::from_secs(60),
        );
        let msg = QueueMessage::for_job(&doc.document_id, &job_id);
        assert!(fetcher.handle(&msg, 1).await.is_err());

        let loaded = store.get_document(&doc.document_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::InProgress);
        assert_eq!(store.output_count().await, 0);
    }

    #[tokio::test]
    async fn test_mismatched_job_is_dropped() {
        let f = fixture().await;
        let msg = QueueMessage::for_job(&f.doc_id, "someone-else");
        f.fetcher.handle(&msg, 1).await.unwrap();
        assert_eq!(f.service.stats().status_calls, 0);
    }
}
