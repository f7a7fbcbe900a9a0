//! Process wiring: one of every stage, connected by queues and the topic.
//!
//! [`Pipeline::build`] creates the components without starting anything, so
//! tests can drive each stage by hand. [`Pipeline::start`] spawns the intake
//! loop, one consumer per queue, the completion listener and the poller.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::analysis::{
    AnalysisError, AnalysisService, HttpAnalysisService, HttpServiceConfig, LocalAnalysisService,
    LocalServiceConfig,
};
use crate::config::Settings;
use crate::models::{DocumentStatus, ObjectCreatedEvent};
use crate::repository::{JobStore, StoreError};
use crate::services::{
    AsyncSubmitter, DocumentRouter, OutputGenerator, Reconciler, ResultFetcher, StageError,
    SyncAnalyzer,
};
use crate::storage::ObjectStore;
use crate::topic::CompletionTopic;
use crate::work_queue::{DeadLetterQueue, InMemoryQueue, MessageQueue, QueueConsumer};

/// Pending create events buffered ahead of the router.
const INTAKE_BUFFER: usize = 1024;

/// Documents per status picked up by startup recovery.
const RECOVERY_SCAN_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline intake is closed")]
    Closed,
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

/// Create the analysis service the settings ask for.
///
/// The in-process service publishes completions to `topic`; a remote service
/// cannot, so its jobs are reconciled by polling.
pub fn analysis_service(
    settings: &Settings,
    objects: Arc<dyn ObjectStore>,
    topic: &CompletionTopic,
) -> Result<Arc<dyn AnalysisService>, AnalysisError> {
    match settings.service_url {
        Some(ref url) => {
            tracing::info!("Using analysis service at {}", url);
            Ok(Arc::new(HttpAnalysisService::new(HttpServiceConfig {
                base_url: url.clone(),
                request_timeout: settings.service_timeout(),
            })?))
        }
        None => {
            tracing::info!("Using in-process analysis service");
            Ok(Arc::new(LocalAnalysisService::new(
                objects,
                Some(topic.clone()),
                LocalServiceConfig {
                    job_duration: Some(settings.local_job_duration()),
                    ..Default::default()
                },
            )))
        }
    }
}

pub struct Pipeline {
    pub settings: Settings,
    pub store: Arc<dyn JobStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub analysis: Arc<dyn AnalysisService>,
    pub topic: CompletionTopic,
    pub dead_letters: DeadLetterQueue,
    pub sync_queue: Arc<InMemoryQueue>,
    pub async_queue: Arc<InMemoryQueue>,
    pub results_queue: Arc<InMemoryQueue>,
    pub router: Arc<DocumentRouter>,
    pub sync_consumer: Arc<QueueConsumer<SyncAnalyzer>>,
    pub async_consumer: Arc<QueueConsumer<AsyncSubmitter>>,
    pub results_consumer: Arc<QueueConsumer<ResultFetcher>>,
    pub reconciler: Arc<Reconciler>,
}

impl Pipeline {
    pub fn build(
        settings: Settings,
        store: Arc<dyn JobStore>,
        objects: Arc<dyn ObjectStore>,
        analysis: Arc<dyn AnalysisService>,
        topic: CompletionTopic,
    ) -> Self {
        let dead_letters = DeadLetterQueue::new();
        let queue = |name: &str, config: crate::config::QueueSettings| {
            Arc::new(InMemoryQueue::new(name, config.queue_config(), dead_letters.clone()))
        };
        let sync_queue = queue("sync", settings.sync_queue);
        let async_queue = queue("async", settings.async_queue);
        let results_queue = queue("results", settings.results_queue);

        let outputs = OutputGenerator::new(objects.clone(), store.clone(), settings.features);

        let router = Arc::new(DocumentRouter::new(
            store.clone(),
            sync_queue.clone(),
            async_queue.clone(),
            settings.routing.clone(),
        ));
        let sync_consumer = Arc::new(QueueConsumer::new(
            sync_queue.clone(),
            Arc::new(SyncAnalyzer::new(
                store.clone(),
                analysis.clone(),
                outputs.clone(),
                settings.sync_timeout(),
            )),
            settings.sync_queue.consumer_config(),
        ));
        let async_consumer = Arc::new(QueueConsumer::new(
            async_queue.clone(),
            Arc::new(AsyncSubmitter::new(
                store.clone(),
                analysis.clone(),
                settings.features,
                settings.notification.clone(),
            )),
            settings.async_queue.consumer_config(),
        ));
        let results_consumer = Arc::new(QueueConsumer::new(
            results_queue.clone(),
            Arc::new(ResultFetcher::new(
                store.clone(),
                analysis.clone(),
                outputs,
                settings.result_fetch_budget(),
            )),
            settings.results_queue.consumer_config(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            analysis.clone(),
            results_queue.clone(),
            settings.poll.scan_limit,
            settings.poll.status_concurrency,
        ));

        Self {
            settings,
            store,
            objects,
            analysis,
            topic,
            dead_letters,
            sync_queue,
            async_queue,
            results_queue,
            router,
            sync_consumer,
            async_consumer,
            results_consumer,
            reconciler,
        }
    }

    /// Re-enqueue work a previous process left behind. Queues live in this
    /// process, so only the job store survives a restart.
    ///
    /// Covers `ROUTED` documents whose message was lost, documents still
    /// `NEW`, and finished jobs whose result fetch never ran. Jobs still
    /// running need nothing here; the poller finds them. Returns how many
    /// messages were enqueued.
    pub async fn recover(&self) -> Result<usize, StageError> {
        // ROUTED first, so documents routed just below are not sent twice.
        let requeued = self.router.requeue_routed(RECOVERY_SCAN_LIMIT).await?;
        let routed = self.router.route_pending(RECOVERY_SCAN_LIMIT).await?;
        let fetches = self.reconciler.requeue_pending_results(RECOVERY_SCAN_LIMIT).await?;
        Ok(requeued + routed + fetches)
    }

    /// Spawn every loop and return a handle for feeding and stopping them.
    pub fn start(self) -> PipelineHandle {
        let pipeline = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(INTAKE_BUFFER);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(intake(
            pipeline.clone(),
            events_rx,
            shutdown_rx.clone(),
        )));

        // One sync consumer per process, processing one message at a time.
        let consumer = pipeline.sync_consumer.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { consumer.run(rx).await }));

        let consumer = pipeline.async_consumer.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { consumer.run(rx).await }));

        let consumer = pipeline.results_consumer.clone();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { consumer.run(rx).await }));

        let reconciler = pipeline.reconciler.clone();
        let subscription = pipeline.topic.subscribe();
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { reconciler.listen(subscription, rx).await }));

        let reconciler = pipeline.reconciler.clone();
        let schedule = pipeline.settings.poll.schedule();
        let rx = shutdown_rx;
        tasks.push(tokio::spawn(async move { reconciler.poll_forever(schedule, rx).await }));

        tracing::info!("Pipeline started with {} tasks", tasks.len());
        PipelineHandle {
            pipeline,
            events: events_tx,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Route create events as they arrive, after recovering whatever a previous
/// run left unfinished.
async fn intake(
    pipeline: Arc<Pipeline>,
    mut events: mpsc::Receiver<ObjectCreatedEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    match pipeline.recover().await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Recovered {} messages from a previous run", n),
        Err(e) => tracing::error!("Startup recovery failed: {}", e),
    }
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = pipeline.router.on_object_created(&event).await {
                    tracing::error!("Routing {} failed: {}", event.location, e);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("Intake stopped");
}

pub struct PipelineHandle {
    pipeline: Arc<Pipeline>,
    events: mpsc::Sender<ObjectCreatedEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Hand an object-created event to the router.
    pub async fn submit(&self, event: ObjectCreatedEvent) -> Result<(), PipelineError> {
        self.events.send(event).await.map_err(|_| PipelineError::Closed)
    }

    /// Wait until every listed document is terminal or `timeout` passes.
    ///
    /// Returns whether all of them finished. Documents not registered yet
    /// count as unfinished.
    pub async fn wait_for_terminal(
        &self,
        document_ids: &[String],
        timeout: Duration,
    ) -> Result<bool, PipelineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let mut done = true;
            for id in document_ids {
                let finished = self
                    .pipeline
                    .store
                    .get_document(id)
                    .await?
                    .is_some_and(|d| d.status.is_terminal());
                if !finished {
                    done = false;
                    break;
                }
            }
            if done {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Result fetches still queued or in flight.
    pub async fn pending_results(&self) -> usize {
        self.pipeline
            .results_queue
            .depth()
            .await
            .map(|d| d.total())
            .unwrap_or(0)
    }

    /// Stop every loop and wait for them to exit.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            tracing::debug!("All pipeline tasks already exited");
        }
        drop(self.events);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Pipeline task panicked: {}", e);
            }
        }
        let counts = self.pipeline.store.count_by_status().await.unwrap_or_default();
        tracing::info!(
            "Pipeline stopped ({} succeeded, {} failed)",
            counts.get(&DocumentStatus::Succeeded).copied().unwrap_or(0),
            counts.get(&DocumentStatus::Failed).copied().unwrap_or(0)
        );
    }
}
