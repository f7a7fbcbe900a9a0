//! Work queues with visibility timeouts and dead-lettering.
//!
//! Stages never call each other directly: the router feeds the sync and async
//! queues, the reconciler feeds the results queue, and each queue is drained
//! by a [`QueueConsumer`] wrapping one stage's [`MessageHandler`].
//!
//! Delivery is at-least-once. A received message stays invisible for the
//! queue's visibility window; if it is not acknowledged by then it becomes
//! receivable again. Once a message has been received `max_receive_count`
//! times without an ack it moves to the shared [`DeadLetterQueue`].

mod dead_letter;
mod error;
mod handle;
mod memory;
pub mod pipeline;
pub mod runner;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use error::QueueError;
pub use handle::{Delivery, Receipt};
pub use memory::InMemoryQueue;
pub use pipeline::{ChunkResult, MessageHandler, Retryable};
pub use runner::{ConsumerConfig, QueueConsumer};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::models::QueueMessage;

/// Per-queue delivery settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// How long a received message stays hidden from other consumers.
    pub visibility_timeout: Duration,
    /// Receives allowed before a message is dead-lettered.
    pub max_receive_count: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 50,
        }
    }
}

/// Approximate queue size, split by visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.visible + self.in_flight
    }
}

/// A message queue that manages the receive/ack/abandon lifecycle.
///
/// Result storage is NOT part of this trait. Handlers write their own
/// results; the queue only tracks whether a message still needs work.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> QueueConfig;

    /// Enqueue a message, returning its queue-assigned id.
    async fn send(&self, message: QueueMessage) -> Result<u64, QueueError>;

    /// Receive up to `max_messages` visible messages.
    ///
    /// Each returned [`Delivery`] must be acked or abandoned.
    async fn receive(&self, max_messages: usize) -> Result<Vec<Delivery>, QueueError>;

    /// Delete a message after successful processing.
    ///
    /// Fails with [`QueueError::ReceiptExpired`] if the message was redelivered
    /// since this delivery was received.
    async fn ack(&self, delivery: Delivery) -> Result<(), QueueError>;

    /// Give up on a delivery. The message is redelivered after its visibility
    /// window, or dead-lettered if it has exhausted its receives.
    async fn abandon(&self, delivery: Delivery, error: &str) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
