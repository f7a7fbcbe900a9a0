//! Queue consumer: drives one [`MessageHandler`] from one [`MessageQueue`].

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use super::pipeline::{ChunkResult, MessageHandler, Retryable};
use super::{Delivery, MessageQueue, QueueError};

/// Consumer sizing.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    /// Messages taken per receive.
    pub batch_size: usize,
    /// Messages processed at once. Bounds calls into downstream services.
    pub concurrency: usize,
    /// Sleep between receives when the queue is empty.
    pub idle_wait: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            concurrency: 1,
            idle_wait: Duration::from_millis(250),
        }
    }
}

/// How one delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Acked,
    Retry,
    Permanent,
}

pub struct QueueConsumer<H: MessageHandler> {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<H>,
    config: ConsumerConfig,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(queue: Arc<dyn MessageQueue>, handler: Arc<H>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Receive one batch and process it with bounded concurrency.
    pub async fn drain_once(&self) -> Result<ChunkResult, QueueError> {
        let batch = self.config.batch_size.max(1);
        let deliveries = self.queue.receive(batch).await?;
        let received = deliveries.len();
        if received == 0 {
            return Ok(ChunkResult::default());
        }

        let outcomes: Vec<Settled> = stream::iter(deliveries)
            .map(|delivery| self.process(delivery))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|o| **o == Settled::Acked).count();
        let permanent = outcomes.iter().filter(|o| **o == Settled::Permanent).count();
        Ok(ChunkResult {
            received,
            succeeded,
            failed: received - succeeded,
            permanent,
            has_more: received == batch,
        })
    }

    /// Drain until the queue has nothing visible. Returns accumulated counts.
    pub async fn drain(&self) -> Result<ChunkResult, QueueError> {
        let mut total = ChunkResult::default();
        loop {
            let chunk = self.drain_once().await?;
            total.received += chunk.received;
            total.succeeded += chunk.succeeded;
            total.failed += chunk.failed;
            total.permanent += chunk.permanent;
            if chunk.received == 0 {
                return Ok(total);
            }
        }
    }

    /// Consume until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "{} consumer started on {} (batch {}, concurrency {})",
            self.handler.stage(),
            self.queue.name(),
            self.config.batch_size,
            self.config.concurrency
        );

        while !*shutdown.borrow() {
            let idle = match self.drain_once().await {
                Ok(chunk) => chunk.received == 0,
                Err(e) => {
                    tracing::error!("{}: receive from {} failed: {}", self.handler.stage(), self.queue.name(), e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle_wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!("{} consumer stopped", self.handler.stage());
    }

    /// Run the handler for one delivery and settle it.
    async fn process(&self, delivery: Delivery) -> Settled {
        let stage = self.handler.stage();
        let document_id = delivery.message().document_id.clone();
        let receive_count = delivery.receive_count();

        // Work past the visibility window races a redelivery, so stop there.
        let deadline = self.queue.config().visibility_timeout;
        let outcome = if deadline.is_zero() {
            self.handler
                .handle(delivery.message(), receive_count)
                .await
                .map_err(|e| (e.to_string(), e.is_transient()))
        } else {
            match tokio::time::timeout(deadline, self.handler.handle(delivery.message(), receive_count)).await {
                Ok(result) => result.map_err(|e| (e.to_string(), e.is_transient())),
                Err(_) => Err((format!("handler exceeded visibility window of {:?}", deadline), true)),
            }
        };

        match outcome {
            Ok(()) => {
                tracing::debug!("{}: processed {}", stage, document_id);
                if let Err(e) = self.queue.ack(delivery).await {
                    tracing::warn!("{}: could not ack {}: {}", stage, document_id, e);
                }
                Settled::Acked
            }
            Err((error, transient)) => {
                if transient {
                    tracing::warn!(
                        "{}: {} failed on receive {}: {}",
                        stage,
                        document_id,
                        receive_count,
                        error
                    );
                } else {
                    tracing::error!(
                        "{}: {} failed permanently on receive {}: {}",
                        stage,
                        document_id,
                        receive_count,
                        error
                    );
                }
                if let Err(e) = self.queue.abandon(delivery, &error).await {
                    tracing::warn!("{}: could not abandon {}: {}", stage, document_id, e);
                }
                if transient {
                    Settled::Retry
                } else {
                    Settled::Permanent
                }
            }
        }
    }
}
