//! Document router: registers new objects and dispatches them to a path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{
    Classification, DocumentRecord, DocumentStatus, ObjectCreatedEvent, QueueMessage,
};
use crate::repository::JobStore;
use crate::storage::guess_content_type;
use crate::work_queue::MessageQueue;

use super::StageError;

/// Classification rule applied at ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    /// Content types eligible for synchronous analysis.
    pub sync_content_types: Vec<String>,
    /// Content types that always go through an asynchronous job.
    pub async_content_types: Vec<String>,
    /// Sync-eligible documents larger than this go async instead.
    pub sync_max_bytes: u64,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            sync_content_types: vec!["image/png".to_string(), "image/jpeg".to_string()],
            async_content_types: vec!["application/pdf".to_string(), "image/tiff".to_string()],
            sync_max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl RoutingPolicy {
    /// Decide the path for a document, or `None` if it is unsupported.
    pub fn classify(&self, content_type: Option<&str>, size_bytes: u64) -> Option<Classification> {
        let content_type = content_type?.to_ascii_lowercase();
        let matches = |types: &[String]| types.iter().any(|t| t.eq_ignore_ascii_case(&content_type));

        if matches(&self.sync_content_types) {
            if size_bytes <= self.sync_max_bytes {
                Some(Classification::Sync)
            } else {
                Some(Classification::Async)
            }
        } else if matches(&self.async_content_types) {
            Some(Classification::Async)
        } else {
            None
        }
    }
}

/// What a routing attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Enqueued on the queue for this classification.
    Routed(Classification),
    /// The document was past `NEW`; nothing was done.
    AlreadyRouted(DocumentStatus),
    /// No path handles this content type; the document was failed.
    Unsupported,
}

pub struct DocumentRouter {
    store: Arc<dyn JobStore>,
    sync_queue: Arc<dyn MessageQueue>,
    async_queue: Arc<dyn MessageQueue>,
    policy: RoutingPolicy,
}

impl DocumentRouter {
    pub fn new(
        store: Arc<dyn JobStore>,
        sync_queue: Arc<dyn MessageQueue>,
        async_queue: Arc<dyn MessageQueue>,
        policy: RoutingPolicy,
    ) -> Self {
        Self {
            store,
            sync_queue,
            async_queue,
            policy,
        }
    }

    /// Register the object behind a create notification and route it.
    ///
    /// Duplicate notifications resolve to the same document id and end up as
    /// no-ops once the document has left `NEW`.
    pub async fn on_object_created(&self, event: &ObjectCreatedEvent) -> Result<RouteOutcome, StageError> {
        let content_type = event
            .content_type
            .clone()
            .or_else(|| guess_content_type(&event.location));
        let record = DocumentRecord::new(event.location.clone(), content_type, event.size_bytes);

        if self.store.insert_document(&record).await? {
            tracing::info!("Registered {} as {}", event.location, record.document_id);
        } else {
            tracing::debug!("{} already registered as {}", event.location, record.document_id);
        }
        self.route(&record.document_id).await
    }

    /// Classify a `NEW` document, enqueue it, then mark it `ROUTED`.
    ///
    /// A document still `NEW` after a previous attempt is enqueued again: the
    /// crash may have happened before the message reached its queue. A stored
    /// classification is always reused, never re-decided.
    pub async fn route(&self, document_id: &str) -> Result<RouteOutcome, StageError> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| StageError::DocumentNotFound(document_id.to_string()))?;

        if doc.status != DocumentStatus::New {
            tracing::debug!("{} is {}; not routing again", document_id, doc.status);
            return Ok(RouteOutcome::AlreadyRouted(doc.status));
        }

        let classification = match doc.classification {
            Some(c) => c,
            None => match self.policy.classify(
                doc.content_type
                    .clone()
                    .or_else(|| guess_content_type(&doc.object_location))
                    .as_deref(),
                doc.size_bytes,
            ) {
                Some(c) => self.assign(document_id, c).await?,
                None => {
                    tracing::warn!(
                        "{} ({}) has unsupported content type {:?}",
                        document_id,
                        doc.object_location,
                        doc.content_type
                    );
                    self.store
                        .transition(document_id, &[DocumentStatus::New], DocumentStatus::Failed)
                        .await?;
                    return Ok(RouteOutcome::Unsupported);
                }
            },
        };

        let queue = match classification {
            Classification::Sync => &self.sync_queue,
            Classification::Async => &self.async_queue,
        };
        queue.send(QueueMessage::for_document(document_id)).await?;

        if self
            .store
            .transition(document_id, &[DocumentStatus::New], DocumentStatus::Routed)
            .await?
        {
            tracing::info!("Routed {} to {}", document_id, queue.name());
        } else {
            tracing::debug!("{} advanced past NEW while routing", document_id);
        }
        Ok(RouteOutcome::Routed(classification))
    }

    /// Route every document left in `NEW`, e.g. after a crash between
    /// registration and routing. Returns how many were enqueued.
    pub async fn route_pending(&self, limit: usize) -> Result<usize, StageError> {
        let pending = self.store.scan_by_status(&[DocumentStatus::New], limit).await?;
        let mut routed = 0;
        for doc in pending {
            match self.route(&doc.document_id).await {
                Ok(RouteOutcome::Routed(_)) => routed += 1,
                Ok(_) => {}
                Err(e) => tracing::error!("Routing {} failed: {}", doc.document_id, e),
            }
        }
        if routed > 0 {
            tracing::info!("Routed {} pending documents", routed);
        }
        Ok(routed)
    }

    /// Re-send every `ROUTED` document to the queue for its stored
    /// classification. Run on startup: queues do not outlive the process, so
    /// a routed document's message may be gone. Returns how many were
    /// enqueued.
    ///
    /// The stages downstream treat a duplicate as a no-op, so resending a
    /// message that did survive is harmless.
    pub async fn requeue_routed(&self, limit: usize) -> Result<usize, StageError> {
        let routed = self.store.scan_by_status(&[DocumentStatus::Routed], limit).await?;
        let mut queued = 0;
        for doc in routed {
            let queue = match (doc.classification, doc.job_id.as_deref()) {
                (Some(Classification::Sync), _) => &self.sync_queue,
                (Some(Classification::Async), None) => &self.async_queue,
                (Some(Classification::Async), Some(job_id)) => {
                    tracing::debug!("{} already has job {}; not resubmitting", doc.document_id, job_id);
                    continue;
                }
                (None, _) => {
                    tracing::warn!("{} is ROUTED without a classification", doc.document_id);
                    continue;
                }
            };
            match queue.send(QueueMessage::for_document(doc.document_id.as_str())).await {
                Ok(_) => queued += 1,
                Err(e) => tracing::error!("Requeueing {} failed: {}", doc.document_id, e),
            }
        }
        if queued > 0 {
            tracing::info!("Requeued {} routed documents", queued);
        }
        Ok(queued)
    }

    /// Store `decided` unless a concurrent router got there first, returning
    /// whichever classification is now stored.
    async fn assign(&self, document_id: &str, decided: Classification) -> Result<Classification, StageError> {
        if self.store.set_classification(document_id, decided).await? {
            return Ok(decided);
        }
        let stored = self
            .store
            .get_document(document_id)
            .await?
            .and_then(|d| d.classification)
            .unwrap_or(decided);
        Ok(stored)
    }
}
