//! Completion reconciler: resolves each async job's terminal status once.
//!
//! Two triggers feed the same [`Reconciler::reconcile`] function: completion
//! notices pushed on the topic, and a periodic poll over jobs whose
//! completion has not been observed yet. A failed job is settled with a
//! compare-and-swap to `FAILED`. A successful job is claimed with
//! [`JobStore::request_results`]; only the claimant enqueues the results
//! message, and the document stays `IN_PROGRESS` until the result fetcher
//! has stored the outputs and marked it `SUCCEEDED`.
//!
//! A crash between the claim and the enqueue leaves a claimed document with
//! no message. [`Reconciler::requeue_pending_results`] re-sends those on
//! startup; the result fetcher tolerates the duplicate this can create.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::watch;

use crate::analysis::{AnalysisError, AnalysisService};
use crate::models::{CompletionNotice, DocumentRecord, DocumentStatus, JobStatus, QueueMessage};
use crate::repository::JobStore;
use crate::topic::CompletionSubscription;
use crate::work_queue::MessageQueue;

use super::StageError;

const IN_FLIGHT: [DocumentStatus; 2] = [DocumentStatus::Submitted, DocumentStatus::InProgress];

/// Which path invoked the reconciler. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Push,
    Poll,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Push => f.write_str("push"),
            Trigger::Poll => f.write_str("poll"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No document matches the job.
    UnknownJob,
    /// Document was already terminal; nothing to do.
    AlreadyTerminal,
    /// The result fetch was already queued; the fetcher owns the document.
    ResultsPending,
    /// Job still running.
    StillRunning,
    /// This trigger claimed the finished job and queued the result fetch.
    Completed,
    /// This trigger won and marked the document failed.
    Failed,
    /// Another trigger finished the document first.
    LostRace,
}

/// Counts from one poll scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub scanned: usize,
    pub still_running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Delay between poll scans.
///
/// Fixed by default. When adaptive, every scan that finds nothing to check
/// doubles the delay up to `max`; any candidates reset it to `base`.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    base: Duration,
    max: Duration,
    adaptive: bool,
    current: Duration,
}

impl PollSchedule {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            base: interval,
            max: interval,
            adaptive: false,
            current: interval,
        }
    }

    pub fn adaptive(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            adaptive: true,
            current: base,
        }
    }

    /// Delay before the next scan, given how many candidates this one found.
    pub fn next_delay(&mut self, candidates: usize) -> Duration {
        if !self.adaptive || candidates > 0 {
            self.current = self.base;
            return self.base;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    analysis: Arc<dyn AnalysisService>,
    results_queue: Arc<dyn MessageQueue>,
    /// Documents examined per poll scan.
    scan_limit: usize,
    /// Concurrent status queries per poll scan.
    status_concurrency: usize,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn JobStore>,
        analysis: Arc<dyn AnalysisService>,
        results_queue: Arc<dyn MessageQueue>,
        scan_limit: usize,
        status_concurrency: usize,
    ) -> Self {
        Self {
            store,
            analysis,
            results_queue,
            scan_limit: scan_limit.max(1),
            status_concurrency: status_concurrency.max(1),
        }
    }

    /// Apply an observed job status to a document.
    ///
    /// Pure with respect to the trigger: push and poll call this with the
    /// same arguments and get the same effect.
    pub async fn reconcile(
        &self,
        doc: &DocumentRecord,
        observed: JobStatus,
        trigger: Trigger,
    ) -> Result<ReconcileOutcome, StageError> {
        let id = &doc.document_id;
        let job_id = doc
            .job_id
            .as_deref()
            .ok_or_else(|| StageError::MissingJobId(id.clone()))?;

        if doc.status.is_terminal() {
            tracing::debug!("[{}] {} already {}; job {} is {}", trigger, id, doc.status, job_id, observed);
            return Ok(ReconcileOutcome::AlreadyTerminal);
        }
        if doc.results_requested_at.is_some() {
            tracing::debug!("[{}] {} job {} results already queued", trigger, id, job_id);
            return Ok(ReconcileOutcome::ResultsPending);
        }

        match observed {
            JobStatus::InProgress => {
                if doc.status == DocumentStatus::Submitted
                    && self
                        .store
                        .transition(id, &[DocumentStatus::Submitted], DocumentStatus::InProgress)
                        .await?
                {
                    tracing::debug!("[{}] {} job {} in progress", trigger, id, job_id);
                }
                self.store.record_attempt(id).await?;
                Ok(ReconcileOutcome::StillRunning)
            }
            JobStatus::Succeeded => {
                if !self.store.request_results(id).await? {
                    tracing::debug!("[{}] {} job {} was reconciled by another trigger", trigger, id, job_id);
                    return Ok(ReconcileOutcome::LostRace);
                }
                self.results_queue
                    .send(QueueMessage::for_job(id.as_str(), job_id))
                    .await?;
                tracing::info!("[{}] {} job {} succeeded; results queued", trigger, id, job_id);
                Ok(ReconcileOutcome::Completed)
            }
            JobStatus::Failed => {
                if self.store.transition(id, &IN_FLIGHT, DocumentStatus::Failed).await? {
                    tracing::warn!("[{}] {} job {} failed", trigger, id, job_id);
                    Ok(ReconcileOutcome::Failed)
                } else {
                    tracing::debug!("[{}] {} job {} was reconciled by another trigger", trigger, id, job_id);
                    Ok(ReconcileOutcome::LostRace)
                }
            }
        }
    }

    /// Push path: handle one completion notice.
    pub async fn on_notification(&self, notice: &CompletionNotice) -> Result<ReconcileOutcome, StageError> {
        let doc = match self.resolve(notice).await? {
            Some(doc) => doc,
            None => {
                // The submitter may not have recorded the job id yet; the poll
                // path will see it once it has.
                tracing::warn!("Completion notice for unknown job {}", notice.job_id);
                return Ok(ReconcileOutcome::UnknownJob);
            }
        };
        self.reconcile(&doc, notice.status, Trigger::Push).await
    }

    async fn resolve(&self, notice: &CompletionNotice) -> Result<Option<DocumentRecord>, StageError> {
        if let Some(tag) = &notice.job_tag {
            if let Some(doc) = self.store.get_document(tag).await? {
                if doc.job_id.as_deref() == Some(notice.job_id.as_str()) {
                    return Ok(Some(doc));
                }
            }
        }
        Ok(self.store.find_by_job_id(&notice.job_id).await?)
    }

    /// Poll path: query every in-flight job once.
    ///
    /// A failure on one document is logged and counted; it never stops the
    /// scan.
    pub async fn poll_once(&self) -> Result<PollReport, StageError> {
        let candidates = self.store.scan_in_flight(false, self.scan_limit).await?;
        let mut report = PollReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        let outcomes: Vec<Result<ReconcileOutcome, StageError>> = stream::iter(candidates)
            .map(|doc| async move { self.poll_document(&doc).await })
            .buffer_unordered(self.status_concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(ReconcileOutcome::StillRunning) => report.still_running += 1,
                Ok(ReconcileOutcome::Completed) => report.completed += 1,
                Ok(ReconcileOutcome::Failed) => report.failed += 1,
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    tracing::error!("Poll reconciliation failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if report.scanned > 0 {
            tracing::debug!(
                "Poll scanned {}: {} running, {} completed, {} failed, {} errors",
                report.scanned,
                report.still_running,
                report.completed,
                report.failed,
                report.errors
            );
        }
        Ok(report)
    }

    async fn poll_document(&self, doc: &DocumentRecord) -> Result<ReconcileOutcome, StageError> {
        let job_id = doc
            .job_id
            .as_deref()
            .ok_or_else(|| StageError::MissingJobId(doc.document_id.clone()))?;
        let status = match self.analysis.get_job_status(job_id).await {
            Ok(status) => status,
            // The service no longer knows the job; it will never complete.
            Err(AnalysisError::JobNotFound(_)) => {
                tracing::warn!("Job {} for {} is unknown to the analysis service", job_id, doc.document_id);
                JobStatus::Failed
            }
            Err(e) => return Err(e.into()),
        };
        // The status query is slow; act on the row as it is now.
        let current = self
            .store
            .get_document(&doc.document_id)
            .await?
            .ok_or_else(|| StageError::DocumentNotFound(doc.document_id.clone()))?;
        self.reconcile(&current, status, Trigger::Poll).await
    }

    /// Re-send the results message of every finished job still waiting on
    /// its fetch. Run on startup, when the previous process's queues are gone.
    pub async fn requeue_pending_results(&self, limit: usize) -> Result<usize, StageError> {
        let waiting = self.store.scan_in_flight(true, limit).await?;
        let mut queued = 0;
        for doc in waiting {
            let Some(job_id) = doc.job_id.as_deref() else {
                tracing::warn!("{} awaits results but has no job id", doc.document_id);
                continue;
            };
            self.results_queue
                .send(QueueMessage::for_job(doc.document_id.as_str(), job_id))
                .await?;
            queued += 1;
        }
        if queued > 0 {
            tracing::info!("Requeued result fetches for {} documents", queued);
        }
        Ok(queued)
    }

    /// Run the push listener until shutdown or until the topic closes.
    pub async fn listen(&self, mut subscription: CompletionSubscription, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Completion listener started");
        loop {
            tokio::select! {
                notice = subscription.recv() => {
                    let Some(notice) = notice else { break };
                    if let Err(e) = self.on_notification(&notice).await {
                        tracing::error!("Handling completion of job {} failed: {}", notice.job_id, e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Completion listener stopped");
    }

    /// Run the poll scheduler until shutdown.
    pub async fn poll_forever(&self, mut schedule: PollSchedule, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Completion poller started");
        while !*shutdown.borrow() {
            let candidates = match self.poll_once().await {
                Ok(report) => report.scanned,
                Err(e) => {
                    tracing::error!("Poll scan failed: {}", e);
                    0
                }
            };
            let delay = schedule.next_delay(candidates);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Completion poller stopped");
    }
}
