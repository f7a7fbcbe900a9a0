//! In-process message queue.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{
    DeadLetter, DeadLetterQueue, Delivery, MessageQueue, QueueConfig, QueueDepth, QueueError,
    Receipt,
};
use crate::models::QueueMessage;

#[derive(Debug)]
struct Entry {
    id: u64,
    message: QueueMessage,
    receive_count: u32,
    /// Bumped on every receive; only the latest receipt may settle the entry.
    generation: u64,
    visible_at: Instant,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    entries: VecDeque<Entry>,
}

/// Queue held in process memory, using tokio's clock for visibility windows.
///
/// Entries are delivered in send order among those currently visible.
pub struct InMemoryQueue {
    name: String,
    config: QueueConfig,
    dead_letters: DeadLetterQueue,
    state: Arc<Mutex<State>>,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig, dead_letters: DeadLetterQueue) -> Self {
        Self {
            name: name.into(),
            config,
            dead_letters,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn dead_letter(&self, entry: Entry) -> DeadLetter {
        DeadLetter {
            source_queue: self.name.clone(),
            message: entry.message,
            receive_count: entry.receive_count,
            last_error: entry.last_error,
            dead_lettered_at: Utc::now(),
        }
    }

    fn expired(&self, receipt: &Receipt) -> QueueError {
        QueueError::ReceiptExpired {
            queue: self.name.clone(),
            message_id: receipt.message_id,
        }
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> QueueConfig {
        self.config
    }

    async fn send(&self, message: QueueMessage) -> Result<u64, QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        tracing::debug!("{}: enqueued message {} for {}", self.name, id, message.document_id);
        state.entries.push_back(Entry {
            id,
            message,
            receive_count: 0,
            generation: 0,
            visible_at: Instant::now(),
            last_error: None,
        });
        Ok(id)
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>, QueueError> {
        let now = Instant::now();
        let mut deliveries = Vec::new();
        let mut exhausted = Vec::new();

        {
            let mut state = self.state.lock().await;
            let mut i = 0;
            while i < state.entries.len() && deliveries.len() < max_messages {
                let entry = &mut state.entries[i];
                if entry.visible_at > now {
                    i += 1;
                    continue;
                }
                // A consumer died or timed out holding the last allowed receive.
                if entry.receive_count >= self.config.max_receive_count {
                    if let Some(entry) = state.entries.remove(i) {
                        exhausted.push(entry);
                    }
                    continue;
                }
                entry.receive_count += 1;
                entry.generation += 1;
                entry.visible_at = now + self.config.visibility_timeout;
                deliveries.push(Delivery::new(
                    entry.message.clone(),
                    Receipt {
                        message_id: entry.id,
                        generation: entry.generation,
                    },
                    entry.receive_count,
                ));
                i += 1;
            }
        }

        for entry in exhausted {
            self.dead_letters.push(self.dead_letter(entry)).await;
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
        let receipt = delivery.consume();
        let mut state = self.state.lock().await;
        let pos = state
            .entries
            .iter()
            .position(|e| e.id == receipt.message_id && e.generation == receipt.generation)
            .ok_or_else(|| self.expired(&receipt))?;
        state.entries.remove(pos);
        Ok(())
    }

    async fn abandon(&self, delivery: Delivery, error: &str) -> Result<(), QueueError> {
        let receipt = delivery.consume();
        let exhausted = {
            let mut state = self.state.lock().await;
            let pos = state
                .entries
                .iter()
                .position(|e| e.id == receipt.message_id && e.generation == receipt.generation)
                .ok_or_else(|| self.expired(&receipt))?;
            let entry = &mut state.entries[pos];
            entry.last_error = Some(error.to_string());
            if entry.receive_count >= self.config.max_receive_count {
                state.entries.remove(pos)
            } else {
                None
            }
        };

        if let Some(entry) = exhausted {
            self.dead_letters.push(self.dead_letter(entry)).await;
        }
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let visible = state.entries.iter().filter(|e| e.visible_at <= now).count();
        Ok(QueueDepth {
            visible,
            in_flight: state.entries.len() - visible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(visibility_secs: u64, max_receive_count: u32) -> (InMemoryQueue, DeadLetterQueue) {
        let dlq = DeadLetterQueue::new();
        let q = InMemoryQueue::new(
            "test",
            QueueConfig {
                visibility_timeout: Duration::from_secs(visibility_secs),
                max_receive_count,
            },
            dlq.clone(),
        );
        (q, dlq)
    }

    #[tokio::test]
    async fn test_received_message_is_hidden_until_ack() {
        let (q, _) = queue(30, 5);
        q.send(QueueMessage::for_document("d1")).await.unwrap();

        let first = q.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message().document_id, "d1");
        assert!(q.receive(10).await.unwrap().is_empty());
        assert_eq!(q.depth().await.unwrap(), QueueDepth { visible: 0, in_flight: 1 });

        for d in first {
            q.ack(d).await.unwrap();
        }
        assert_eq!(q.depth().await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_reappears_after_visibility_window() {
        let (q, _) = queue(30, 5);
        q.send(QueueMessage::for_document("d1")).await.unwrap();

        let first = q.receive(1).await.unwrap();
        q.abandon(first.into_iter().next().unwrap(), "boom").await.unwrap();
        assert!(q.receive(1).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let again = q.receive(1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count(), 2);
        for d in again {
            q.ack(d).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_receipt_cannot_ack() {
        let (q, _) = queue(30, 5);
        q.send(QueueMessage::for_document("d1")).await.unwrap();

        let stale = q.receive(1).await.unwrap().pop().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        let fresh = q.receive(1).await.unwrap().pop().unwrap();

        let result = q.ack(stale).await;
        assert!(matches!(result, Err(QueueError::ReceiptExpired { .. })));
        q.ack(fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_message_moves_to_dead_letters() {
        let (q, dlq) = queue(0, 3);
        q.send(QueueMessage::for_document("poison")).await.unwrap();

        for attempt in 1..=3 {
            let d = q.receive(1).await.unwrap().pop().unwrap();
            assert_eq!(d.receive_count(), attempt);
            q.abandon(d, "analysis failed").await.unwrap();
        }

        assert!(q.receive(1).await.unwrap().is_empty());
        let letters = dlq.list().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].source_queue, "test");
        assert_eq!(letters[0].receive_count, 3);
        assert_eq!(letters[0].last_error.as_deref(), Some("analysis failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_dead_lettered_on_next_receive() {
        let (q, dlq) = queue(10, 1);
        q.send(QueueMessage::for_document("d1")).await.unwrap();

        let held = q.receive(1).await.unwrap().pop().unwrap();
        // Consumer vanished without settling.
        std::mem::forget(held);
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(q.receive(1).await.unwrap().is_empty());
        assert_eq!(dlq.len().await, 1);
    }

    #[tokio::test]
    async fn test_redrive_returns_messages_to_source() {
        let (q, dlq) = queue(0, 1);
        q.send(QueueMessage::for_document("d1")).await.unwrap();
        let d = q.receive(1).await.unwrap().pop().unwrap();
        q.abandon(d, "boom").await.unwrap();
        assert_eq!(dlq.len().await, 1);

        assert_eq!(dlq.redrive(&q).await.unwrap(), 1);
        assert!(dlq.is_empty().await);
        let d = q.receive(1).await.unwrap().pop().unwrap();
        assert_eq!(d.receive_count(), 1);
        q.ack(d).await.unwrap();
    }
}
