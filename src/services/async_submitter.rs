//! Async submitter: starts one analysis job per document.

use std::sync::Arc;

use async_trait::async_trait;

use crate::analysis::{AnalysisService, FeatureSet, NotificationChannel, StartJobRequest};
use crate::models::{Classification, DocumentStatus, QueueMessage};
use crate::repository::JobStore;
use crate::work_queue::MessageHandler;

use super::StageError;

pub struct AsyncSubmitter {
    store: Arc<dyn JobStore>,
    analysis: Arc<dyn AnalysisService>,
    features: FeatureSet,
    notification: NotificationChannel,
}

impl AsyncSubmitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        analysis: Arc<dyn AnalysisService>,
        features: FeatureSet,
        notification: NotificationChannel,
    ) -> Self {
        Self {
            store,
            analysis,
            features,
            notification,
        }
    }
}

#[async_trait]
impl MessageHandler for AsyncSubmitter {
    type Error = StageError;

    fn stage(&self) -> &str {
        "async-submitter"
    }

    async fn handle(&self, message: &QueueMessage, _receive_count: u32) -> Result<(), StageError> {
        let id = &message.document_id;
        let doc = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| StageError::DocumentNotFound(id.clone()))?;

        if let Some(job_id) = &doc.job_id {
            tracing::debug!("{} already submitted as job {}", id, job_id);
            return Ok(());
        }
        if doc.status.is_terminal() {
            tracing::debug!("{} is already {}; not submitting", id, doc.status);
            return Ok(());
        }
        if doc.classification != Some(Classification::Async) {
            tracing::warn!("{} is not classified ASYNC; dropping message", id);
            return Ok(());
        }
        // The router enqueues before recording ROUTED; finish its step.
        if doc.status == DocumentStatus::New {
            self.store
                .transition(id, &[DocumentStatus::New], DocumentStatus::Routed)
                .await?;
        }

        let request = StartJobRequest {
            document: doc.object_location.clone(),
            features: self.features,
            job_tag: doc.document_id.clone(),
            notification_channel: self.notification.clone(),
        };
        let job_id = match self.analysis.start_job(&request).await {
            Ok(job_id) => job_id,
            Err(e) => {
                self.store.record_attempt(id).await?;
                return Err(e.into());
            }
        };

        if self.store.set_job_id(id, &job_id).await? {
            tracing::info!("Submitted {} as job {}", id, job_id);
        } else {
            tracing::warn!(
                "{} was submitted concurrently; job {} is orphaned and will be ignored",
                id,
                job_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{LocalAnalysisService, LocalServiceConfig};
    use crate::models::{DocumentRecord, ObjectLocation};
    use crate::repository::InMemoryJobStore;
    use crate::storage::{InMemoryObjectStore, ObjectStore};

    async fn fixture(status: DocumentStatus) -> (InMemoryJobStore, LocalAnalysisService, AsyncSubmitter, String) {
        let objects = InMemoryObjectStore::new();
        let loc = ObjectLocation::new("docs", "report.pdf");
        objects.put(&loc, b"Title: Report".to_vec(), None).await.unwrap();

        let store = InMemoryJobStore::new();
        let mut doc = DocumentRecord::new(loc, Some("application/pdf".into()), 13);
        doc.classification = Some(Classification::Async);
        doc.status = status;
        store.insert_document(&doc).await.unwrap();

        let service = LocalAnalysisService::new(
            Arc::new(objects) as Arc<dyn ObjectStore>,
            None,
            LocalServiceConfig {
                job_duration: None,
                ..Default::default()
            },
        );
        let submitter = AsyncSubmitter::new(
            Arc::new(store.clone()),
            Arc::new(service.clone()),
            FeatureSet::default(),
            NotificationChannel {
                topic: "completions".into(),
                publisher_role: "analysis-publisher".into(),
            },
        );
        (store, service, submitter, doc.document_id)
    }

    #[tokio::test]
    async fn test_submits_once_under_redelivery() {
        let (store, service, submitter, id) = fixture(DocumentStatus::Routed).await;
        let msg = QueueMessage::for_document(&id);

        submitter.handle(&msg, 1).await.unwrap();
        submitter.handle(&msg, 2).await.unwrap();

        assert_eq!(service.stats().start_job_calls, 1);
        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Submitted);
        assert!(doc.job_id.is_some());
        assert_eq!(doc.attempts, 1);
    }

    #[tokio::test]
    async fn test_completes_router_step_when_still_new() {
        let (store, _, submitter, id) = fixture(DocumentStatus::New).await;
        submitter.handle(&QueueMessage::for_document(&id), 1).await.unwrap();
        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Submitted);
    }

    #[tokio::test]
    async fn test_start_failure_is_retryable() {
        let (store, service, submitter, id) = fixture(DocumentStatus::Routed).await;
        service.fail_next_start(1);
        let msg = QueueMessage::for_document(&id);

        let err = submitter.handle(&msg, 1).await.unwrap_err();
        assert!(err.is_transient());
        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Routed);
        assert!(doc.job_id.is_none());

        submitter.handle(&msg, 2).await.unwrap();
        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Submitted);
        assert_eq!(doc.attempts, 2);
    }
}
