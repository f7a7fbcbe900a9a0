//! Stage handler abstraction driven by [`QueueConsumer`](super::QueueConsumer).

use async_trait::async_trait;

use crate::models::QueueMessage;

/// Outcome of one receive-and-process round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub received: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Failures the handler classified as permanent. Included in `failed`.
    pub permanent: usize,
    /// Whether the receive was full, so more work is probably waiting.
    pub has_more: bool,
}

/// Classification of a handler failure.
///
/// Both kinds are redelivered until the message is dead-lettered; the
/// consumer only reports them differently.
pub trait Retryable {
    /// Whether a redelivery has a chance of succeeding.
    fn is_transient(&self) -> bool {
        true
    }
}

/// A self-contained processing stage fed by one queue.
///
/// Handlers must be idempotent: the same message can arrive more than once,
/// and a retried message may find the work already done.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Error: std::error::Error + Retryable + Send + Sync + 'static;

    /// Stage name used in logs.
    fn stage(&self) -> &str;

    /// Process one message. `Ok` acknowledges it; `Err` leaves it for
    /// redelivery.
    async fn handle(&self, message: &QueueMessage, receive_count: u32) -> Result<(), Self::Error>;
}
