//! Delivery handle: a received message plus the receipt needed to settle it.

use crate::models::QueueMessage;

/// Identifies one specific receive of a message.
///
/// Each redelivery bumps `generation`, so a receipt from an earlier receive
/// cannot acknowledge a message another consumer now holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub message_id: u64,
    pub generation: u64,
}

/// A received message. Move semantics: consumed by `ack()` or `abandon()`.
///
/// If dropped without being consumed, logs a warning. The visibility window
/// is the real safety net: the message becomes receivable again once it
/// expires.
pub struct Delivery {
    message: QueueMessage,
    receipt: Receipt,
    receive_count: u32,
    consumed: bool,
}

impl Delivery {
    pub(crate) fn new(message: QueueMessage, receipt: Receipt, receive_count: u32) -> Self {
        Self {
            message,
            receipt,
            receive_count,
            consumed: false,
        }
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }

    /// How many times this message has been received, this delivery included.
    pub fn receive_count(&self) -> u32 {
        self.receive_count
    }

    /// Mark this handle as consumed (called internally by ack/abandon).
    pub(crate) fn consume(mut self) -> Receipt {
        self.consumed = true;
        self.receipt.clone()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("receipt", &self.receipt)
            .field("receive_count", &self.receive_count)
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.consumed {
            tracing::warn!(
                "Delivery of message {} for document {} dropped without ack; \
                 it will be redelivered after the visibility window",
                self.receipt.message_id,
                self.message.document_id
            );
        }
    }
}
