//! Dead-letter queue shared by every work queue.
//!
//! Holds messages that exceeded their queue's maximum receive count. Nothing
//! in the pipeline consumes it; operators list or redrive its contents.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::{MessageQueue, QueueError};
use crate::models::QueueMessage;

/// A message that ran out of retries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub source_queue: String,
    pub message: QueueMessage,
    pub receive_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct DeadLetterQueue {
    entries: Arc<Mutex<Vec<DeadLetter>>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn push(&self, letter: DeadLetter) {
        tracing::error!(
            "Message for document {} exceeded {} receives on {} and was dead-lettered (last error: {})",
            letter.message.document_id,
            letter.receive_count,
            letter.source_queue,
            letter.last_error.as_deref().unwrap_or("none recorded")
        );
        self.entries.lock().await.push(letter);
    }

    /// Snapshot of all dead letters, oldest first.
    pub async fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Send every dead letter that came from `target` back onto it.
    ///
    /// Returns the number of messages redriven. Letters that fail to send stay
    /// in the dead-letter queue.
    pub async fn redrive(&self, target: &dyn MessageQueue) -> Result<usize, QueueError> {
        let mut entries = self.entries.lock().await;
        let (matching, rest): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|l| l.source_queue == target.name());
        *entries = rest;

        let mut redriven = 0;
        let mut pending = matching.into_iter();
        while let Some(letter) = pending.next() {
            if let Err(e) = target.send(letter.message.clone()).await {
                entries.push(letter);
                entries.extend(pending);
                return Err(e);
            }
            redriven += 1;
        }
        tracing::info!("Redrove {} dead letters onto {}", redriven, target.name());
        Ok(redriven)
    }
}
