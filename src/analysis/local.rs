//! In-process analysis service.
//!
//! Reads the document as UTF-8 text instead of running OCR: form feeds split
//! pages, `key: value` lines become form fields and `|`-separated lines become
//! table rows. Jobs finish after a configurable delay and announce themselves
//! on the completion topic, or wait for [`LocalAnalysisService::finish_job`]
//! when no delay is configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    AnalysisError, AnalysisOutput, AnalysisService, FeatureSet, KeyValue, NotificationChannel,
    PageAnalysis, ResultPage, StartJobRequest, Table,
};
use crate::models::{CompletionNotice, JobStatus, ObjectLocation};
use crate::storage::ObjectStore;
use crate::topic::CompletionTopic;

const PAGE_BREAK: char = '\u{000C}';

#[derive(Debug, Clone)]
pub struct LocalServiceConfig {
    /// How long a job runs before completing on its own. `None` leaves jobs
    /// in progress until finished explicitly.
    pub job_duration: Option<Duration>,
    /// Simulated latency of a synchronous analyze call.
    pub analyze_latency: Duration,
    /// Document pages returned per result page.
    pub result_page_size: usize,
}

impl Default for LocalServiceConfig {
    fn default() -> Self {
        Self {
            job_duration: Some(Duration::from_millis(200)),
            analyze_latency: Duration::ZERO,
            result_page_size: 1,
        }
    }
}

/// Call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub analyze_calls: usize,
    pub start_job_calls: usize,
    pub status_calls: usize,
    pub result_calls: usize,
    /// Most synchronous analyze calls ever running at once.
    pub max_in_flight: usize,
}

#[derive(Debug)]
struct LocalJob {
    job_tag: String,
    notification: NotificationChannel,
    status: JobStatus,
    output: Result<AnalysisOutput, String>,
}

struct Inner {
    objects: Arc<dyn ObjectStore>,
    topic: Option<CompletionTopic>,
    config: LocalServiceConfig,
    jobs: RwLock<HashMap<String, LocalJob>>,
    fail_analyze: AtomicU32,
    fail_start: AtomicU32,
    drop_notifications: AtomicBool,
    analyze_calls: AtomicUsize,
    start_job_calls: AtomicUsize,
    status_calls: AtomicUsize,
    result_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Clone)]
pub struct LocalAnalysisService {
    inner: Arc<Inner>,
}

/// Decrements the in-flight gauge when the call ends, however it ends.
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Take one unit from a failure budget, returning whether it was available.
fn take_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LocalAnalysisService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        topic: Option<CompletionTopic>,
        config: LocalServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                objects,
                topic,
                config,
                jobs: RwLock::new(HashMap::new()),
                fail_analyze: AtomicU32::new(0),
                fail_start: AtomicU32::new(0),
                drop_notifications: AtomicBool::new(false),
                analyze_calls: AtomicUsize::new(0),
                start_job_calls: AtomicUsize::new(0),
                status_calls: AtomicUsize::new(0),
                result_calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Fail the next `n` analyze calls with a transient service error.
    pub fn fail_next_analyze(&self, n: u32) {
        self.inner.fail_analyze.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` start-job calls with a transient service error.
    pub fn fail_next_start(&self, n: u32) {
        self.inner.fail_start.store(n, Ordering::SeqCst);
    }

    /// Stop publishing completion notices, as if the callback were lost.
    pub fn drop_notifications(&self, drop: bool) {
        self.inner.drop_notifications.store(drop, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ServiceStats {
        let i = &self.inner;
        ServiceStats {
            analyze_calls: i.analyze_calls.load(Ordering::SeqCst),
            start_job_calls: i.start_job_calls.load(Ordering::SeqCst),
            status_calls: i.status_calls.load(Ordering::SeqCst),
            result_calls: i.result_calls.load(Ordering::SeqCst),
            max_in_flight: i.max_in_flight.load(Ordering::SeqCst),
        }
    }

    /// Move a job to `status`. Publishes a completion notice when `notify` is
    /// set and the status is terminal.
    pub async fn finish_job(
        &self,
        job_id: &str,
        status: JobStatus,
        notify: bool,
    ) -> Result<(), AnalysisError> {
        self.inner.finish_job(job_id, status, notify).await
    }
}

impl Inner {
    async fn finish_job(&self, job_id: &str, status: JobStatus, notify: bool) -> Result<(), AnalysisError> {
        let (job_tag, channel) = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| AnalysisError::JobNotFound(job_id.to_string()))?;
            job.status = status;
            (job.job_tag.clone(), job.notification.clone())
        };
        tracing::debug!("Local job {} is now {}", job_id, status);

        if notify && status.is_terminal() {
            self.publish(&channel, CompletionNotice {
                job_id: job_id.to_string(),
                status,
                job_tag: Some(job_tag),
            });
        }
        Ok(())
    }

    fn publish(&self, channel: &NotificationChannel, notice: CompletionNotice) {
        if self.drop_notifications.load(Ordering::SeqCst) {
            tracing::debug!("Dropping completion notice for job {}", notice.job_id);
            return;
        }
        match &self.topic {
            Some(topic) if topic.name() == channel.topic && !channel.publisher_role.is_empty() => {
                topic.publish(notice);
            }
            _ => tracing::warn!(
                "Cannot publish completion of job {} to topic {} as {:?}",
                notice.job_id,
                channel.topic,
                channel.publisher_role
            ),
        }
    }

    async fn read_document(&self, document: &ObjectLocation, features: FeatureSet) -> Result<AnalysisOutput, AnalysisError> {
        let bytes = self.objects.get(document).await?;
        let text = String::from_utf8(bytes)
            .map_err(|_| AnalysisError::InvalidDocument(format!("{} is not readable text", document)))?;
        Ok(parse_document(&text, features))
    }
}

/// Extract pages, form fields and tables from plain text.
pub fn parse_document(text: &str, features: FeatureSet) -> AnalysisOutput {
    if text.trim().is_empty() {
        return AnalysisOutput::default();
    }

    let pages = text
        .split(PAGE_BREAK)
        .enumerate()
        .map(|(i, body)| parse_page(i as u32 + 1, body, features))
        .collect();
    AnalysisOutput { pages }
}

fn parse_page(page_number: u32, body: &str, features: FeatureSet) -> PageAnalysis {
    let mut page = PageAnalysis {
        page_number,
        lines: Vec::new(),
        key_values: Vec::new(),
        tables: Vec::new(),
    };
    let mut table: Option<Table> = None;

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        page.lines.push(line.to_string());

        if line.contains('|') {
            let row = line
                .trim_matches('|')
                .split('|')
                .map(|cell| cell.trim().to_string())
                .collect();
            table.get_or_insert_with(Table::default).rows.push(row);
            continue;
        }
        // Any other line ends the current table.
        if let Some(done) = table.take() {
            page.tables.push(done);
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                let value = value.trim();
                page.key_values.push(KeyValue {
                    key: key.to_string(),
                    value: (!value.is_empty()).then(|| value.to_string()),
                });
            }
        }
    }
    if let Some(done) = table {
        page.tables.push(done);
    }

    if !features.forms {
        page.key_values.clear();
    }
    if !features.tables {
        page.tables.clear();
    }
    page
}

#[async_trait]
impl AnalysisService for LocalAnalysisService {
    async fn analyze(
        &self,
        document: &ObjectLocation,
        features: FeatureSet,
    ) -> Result<AnalysisOutput, AnalysisError> {
        let inner = &self.inner;
        inner.analyze_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight::enter(inner);

        if !inner.config.analyze_latency.is_zero() {
            tokio::time::sleep(inner.config.analyze_latency).await;
        }
        if take_failure(&inner.fail_analyze) {
            return Err(AnalysisError::Service("injected analyze failure".to_string()));
        }
        inner.read_document(document, features).await
    }

    async fn start_job(&self, request: &StartJobRequest) -> Result<String, AnalysisError> {
        let inner = &self.inner;
        inner.start_job_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&inner.fail_start) {
            return Err(AnalysisError::Service("injected start failure".to_string()));
        }
        if inner.objects.head(&request.document).await?.is_none() {
            return Err(AnalysisError::InvalidDocument(format!("{} does not exist", request.document)));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let output = inner
            .read_document(&request.document, request.features)
            .await
            .map_err(|e| e.to_string());
        inner.jobs.write().await.insert(
            job_id.clone(),
            LocalJob {
                job_tag: request.job_tag.clone(),
                notification: request.notification_channel.clone(),
                status: JobStatus::InProgress,
                output,
            },
        );
        tracing::debug!("Started local job {} for {}", job_id, request.document);

        if let Some(duration) = inner.config.job_duration {
            let inner = Arc::clone(&self.inner);
            let id = job_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let status = match inner.jobs.read().await.get(&id) {
                    Some(job) if job.status.is_terminal() => return,
                    Some(job) if job.output.is_err() => JobStatus::Failed,
                    Some(_) => JobStatus::Succeeded,
                    None => return,
                };
                if let Err(e) = inner.finish_job(&id, status, true).await {
                    tracing::warn!("Could not finish local job {}: {}", id, e);
                }
            });
        }
        Ok(job_id)
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatus, AnalysisError> {
        self.inner.status_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .jobs
            .read()
            .await
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| AnalysisError::JobNotFound(job_id.to_string()))
    }

    async fn get_job_result(
        &self,
        job_id: &str,
        page_token: Option<&str>,
    ) -> Result<ResultPage, AnalysisError> {
        self.inner.result_calls.fetch_add(1, Ordering::SeqCst);
        let jobs = self.inner.jobs.read().await;
        let job = jobs
            .get(job_id)
            .ok_or_else(|| AnalysisError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Succeeded {
            return Err(AnalysisError::Service(format!("job {} is {}", job_id, job.status)));
        }
        let output = job.output.as_ref().map_err(|e| AnalysisError::Service(e.clone()))?;

        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| AnalysisError::Service(format!("bad page token {:?}", token)))?,
            None => 0,
        };
        let size = self.inner.config.result_page_size.max(1);
        let end = (start + size).min(output.pages.len());
        Ok(ResultPage {
            pages: output.pages.get(start..end).unwrap_or_default().to_vec(),
            next_token: (end < output.pages.len()).then(|| end.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;

    const SAMPLE: &str = "Invoice 42\nVendor: Acme\nNotes:\n| item | qty |\n| bolts | 10 |\nthanks\u{000C}Page two\nTotal: 12";

    fn channel() -> NotificationChannel {
        NotificationChannel {
            topic: "completions".into(),
            publisher_role: "analysis-publisher".into(),
        }
    }

    async fn service(config: LocalServiceConfig) -> (LocalAnalysisService, CompletionTopic, ObjectLocation) {
        let objects = InMemoryObjectStore::new();
        let loc = ObjectLocation::new("docs", "invoice.pdf");
        objects.put(&loc, SAMPLE.as_bytes().to_vec(), None).await.unwrap();
        let topic = CompletionTopic::new("completions");
        let svc = LocalAnalysisService::new(Arc::new(objects), Some(topic.clone()), config);
        (svc, topic, loc)
    }

    fn request(loc: &ObjectLocation) -> StartJobRequest {
        StartJobRequest {
            document: loc.clone(),
            features: FeatureSet::default(),
            job_tag: "d1".into(),
            notification_channel: channel(),
        }
    }

    #[test]
    fn test_parse_document_pages_forms_tables() {
        let output = parse_document(SAMPLE, FeatureSet::default());
        assert_eq!(output.pages.len(), 2);

        let first = &output.pages[0];
        assert_eq!(first.page_number, 1);
        assert_eq!(first.lines.len(), 6);
        assert_eq!(first.key_values[0], KeyValue { key: "Vendor".into(), value: Some("Acme".into()) });
        assert_eq!(first.key_values[1], KeyValue { key: "Notes".into(), value: None });
        assert_eq!(first.tables.len(), 1);
        assert_eq!(first.tables[0].rows, vec![vec!["item", "qty"], vec!["bolts", "10"]]);

        assert_eq!(output.pages[1].key_values[0].key, "Total");
    }

    #[test]
    fn test_parse_respects_features_and_blank_input() {
        let output = parse_document(SAMPLE, FeatureSet { forms: false, tables: false });
        assert!(output.pages[0].key_values.is_empty());
        assert!(output.pages[0].tables.is_empty());
        assert!(parse_document("  \n ", FeatureSet::default()).is_empty());
    }

    #[tokio::test]
    async fn test_analyze_counts_and_injected_failures() {
        let (svc, _, loc) = service(LocalServiceConfig::default()).await;
        svc.fail_next_analyze(1);
        assert!(svc.analyze(&loc, FeatureSet::default()).await.is_err());
        let output = svc.analyze(&loc, FeatureSet::default()).await.unwrap();
        assert_eq!(output.pages.len(), 2);

        let stats = svc.stats();
        assert_eq!(stats.analyze_calls, 2);
        assert_eq!(stats.max_in_flight, 1);
    }

    #[tokio::test]
    async fn test_manual_job_paginates_after_finish() {
        let config = LocalServiceConfig {
            job_duration: None,
            ..Default::default()
        };
        let (svc, topic, loc) = service(config).await;
        let mut sub = topic.subscribe();

        let job_id = svc.start_job(&request(&loc)).await.unwrap();
        assert_eq!(svc.get_job_status(&job_id).await.unwrap(), JobStatus::InProgress);
        assert!(svc.get_job_result(&job_id, None).await.is_err());

        svc.finish_job(&job_id, JobStatus::Succeeded, true).await.unwrap();
        let notice = sub.recv().await.unwrap();
        assert_eq!(notice.job_id, job_id);
        assert_eq!(notice.job_tag.as_deref(), Some("d1"));

        let first = svc.get_job_result(&job_id, None).await.unwrap();
        assert_eq!(first.pages.len(), 1);
        let token = first.next_token.unwrap();
        let second = svc.get_job_result(&job_id, Some(&token)).await.unwrap();
        assert_eq!(second.pages[0].page_number, 2);
        assert!(second.next_token.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_job_completes_and_notifies() {
        let (svc, topic, loc) = service(LocalServiceConfig::default()).await;
        let mut sub = topic.subscribe();

        let job_id = svc.start_job(&request(&loc)).await.unwrap();
        let notice = sub.recv().await.unwrap();
        assert_eq!(notice.job_id, job_id);
        assert_eq!(notice.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (svc, _, _) = service(LocalServiceConfig::default()).await;
        assert!(matches!(
            svc.get_job_status("missing").await,
            Err(AnalysisError::JobNotFound(_))
        ));
    }
}
