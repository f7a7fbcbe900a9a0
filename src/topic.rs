//! Completion topic: publish/subscribe channel for finished analysis jobs.
//!
//! The analysis service publishes here when an asynchronous job reaches a
//! terminal status. Delivery is best effort. A subscriber that falls behind
//! loses notices, and the poll path picks those jobs up instead.

use tokio::sync::broadcast;

use crate::models::CompletionNotice;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct CompletionTopic {
    name: String,
    sender: broadcast::Sender<CompletionNotice>,
}

impl CompletionTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a notice, returning how many subscribers received it.
    pub fn publish(&self, notice: CompletionNotice) -> usize {
        match self.sender.send(notice) {
            Ok(n) => n,
            Err(broadcast::error::SendError(notice)) => {
                tracing::debug!(
                    "No subscribers on {}; notice for job {} dropped",
                    self.name,
                    notice.job_id
                );
                0
            }
        }
    }

    pub fn subscribe(&self) -> CompletionSubscription {
        CompletionSubscription {
            topic: self.name.clone(),
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct CompletionSubscription {
    topic: String,
    receiver: broadcast::Receiver<CompletionNotice>,
}

impl CompletionSubscription {
    /// Next notice, or `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<CompletionNotice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) => return Some(notice),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        "Subscriber on {} lagged and missed {} completion notices",
                        self.topic,
                        missed
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobStatus;

    fn notice(job_id: &str) -> CompletionNotice {
        CompletionNotice {
            job_id: job_id.to_string(),
            status: JobStatus::Succeeded,
            job_tag: None,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let topic = CompletionTopic::new("completions");
        let mut a = topic.subscribe();
        let mut b = topic.subscribe();

        assert_eq!(topic.publish(notice("j1")), 2);
        assert_eq!(a.recv().await.unwrap().job_id, "j1");
        assert_eq!(b.recv().await.unwrap().job_id, "j1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let topic = CompletionTopic::new("completions");
        assert_eq!(topic.publish(notice("j1")), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let topic = CompletionTopic::with_capacity("completions", 2);
        let mut sub = topic.subscribe();
        for id in ["j1", "j2", "j3"] {
            topic.publish(notice(id));
        }
        // j1 was overwritten; the subscriber resumes at the oldest retained notice.
        assert_eq!(sub.recv().await.unwrap().job_id, "j2");
        assert_eq!(sub.recv().await.unwrap().job_id, "j3");
    }

    #[tokio::test]
    async fn test_recv_ends_when_topic_dropped() {
        let topic = CompletionTopic::new("completions");
        let mut sub = topic.subscribe();
        drop(topic);
        assert!(sub.recv().await.is_none());
    }
}
