//! Sync analyzer: analyzes small documents inline, one at a time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::analysis::{AnalysisError, AnalysisService, FeatureSet};
use crate::models::{Classification, DocumentStatus, QueueMessage};
use crate::repository::JobStore;
use crate::work_queue::MessageHandler;

use super::{OutputGenerator, StageError};

pub struct SyncAnalyzer {
    store: Arc<dyn JobStore>,
    analysis: Arc<dyn AnalysisService>,
    outputs: OutputGenerator,
    features: FeatureSet,
    /// Must stay below the sync queue's visibility window.
    timeout: Duration,
}

impl SyncAnalyzer {
    pub fn new(
        store: Arc<dyn JobStore>,
        analysis: Arc<dyn AnalysisService>,
        outputs: OutputGenerator,
        timeout: Duration,
    ) -> Self {
        let features = outputs.features();
        Self {
            store,
            analysis,
            outputs,
            features,
            timeout,
        }
    }
}

#[async_trait]
impl MessageHandler for SyncAnalyzer {
    type Error = StageError;

    fn stage(&self) -> &str {
        "sync-analyzer"
    }

    async fn handle(&self, message: &QueueMessage, receive_count: u32) -> Result<(), StageError> {
        let id = &message.document_id;
        let doc = self
            .store
            .get_document(id)
            .await?
            .ok_or_else(|| StageError::DocumentNotFound(id.clone()))?;

        if doc.status.is_terminal() {
            tracing::debug!("{} is already {}; skipping analysis", id, doc.status);
            return Ok(());
        }
        if doc.classification != Some(Classification::Sync) {
            tracing::warn!("{} is not classified SYNC; dropping message", id);
            return Ok(());
        }

        let attempt = self.store.record_attempt(id).await?;
        tracing::debug!("Analyzing {} (attempt {}, receive {})", id, attempt, receive_count);

        let output = tokio::time::timeout(
            self.timeout,
            self.analysis.analyze(&doc.object_location, self.features),
        )
        .await
        .map_err(|_| AnalysisError::Timeout)??;

        self.outputs.write(&doc, &output).await?;

        // The router may not have recorded ROUTED yet.
        let from = [DocumentStatus::New, DocumentStatus::Routed];
        if self.store.transition(id, &from, DocumentStatus::Succeeded).await? {
            tracing::info!("{} analyzed: {} pages", id, output.pages.len());
        } else {
            tracing::debug!("{} was finalized concurrently", id);
        }
        Ok(())
    }
}
