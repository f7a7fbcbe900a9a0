//! Work queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Receipt for message {message_id} on {queue} is no longer valid")]
    ReceiptExpired { queue: String, message_id: u64 },
}
