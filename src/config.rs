//! Configuration management for ocrflow using the prefer crate.
//!
//! [`Config`] is what a file may contain; every field is optional.
//! [`Settings`] is the resolved runtime view: defaults, then the config file,
//! then environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{FeatureSet, NotificationChannel};
use crate::services::{PollSchedule, RoutingPolicy};
use crate::work_queue::{ConsumerConfig, QueueConfig};

/// Default database filename.
pub const DEFAULT_DATABASE_FILENAME: &str = "ocrflow.db";

/// Default object store subdirectory name.
const OBJECTS_SUBDIR: &str = "objects";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Delivery and consumer settings for one work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub visibility_timeout_secs: u64,
    pub max_receive_count: u32,
    pub batch_size: usize,
    pub concurrency: usize,
}

impl QueueSettings {
    const fn new(visibility_timeout_secs: u64, batch_size: usize, concurrency: usize) -> Self {
        Self {
            visibility_timeout_secs,
            max_receive_count: 50,
            batch_size,
            concurrency,
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout: self.visibility_timeout(),
            max_receive_count: self.max_receive_count,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            ..Default::default()
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max_receive_count == 0 {
            return Err(ConfigError::Invalid(format!("{name} queue max_receive_count must be at least 1")));
        }
        if self.concurrency == 0 || self.batch_size == 0 {
            return Err(ConfigError::Invalid(format!("{name} queue concurrency and batch_size must be at least 1")));
        }
        Ok(())
    }
}

/// Poll-path settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSettings {
    pub interval_secs: u64,
    /// Back off while there is nothing in flight.
    pub adaptive: bool,
    pub max_interval_secs: u64,
    /// Documents examined per scan.
    pub scan_limit: usize,
    /// Concurrent job-status queries per scan.
    pub status_concurrency: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            adaptive: false,
            max_interval_secs: 600,
            scan_limit: 100,
            status_concurrency: 10,
        }
    }
}

impl PollSettings {
    pub fn schedule(&self) -> PollSchedule {
        let base = Duration::from_secs(self.interval_secs);
        if self.adaptive {
            PollSchedule::adaptive(base, Duration::from_secs(self.max_interval_secs))
        } else {
            PollSchedule::fixed(base)
        }
    }
}

/// Application settings.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    /// Base data directory.
    pub data_dir: PathBuf,
    /// Database filename.
    pub database_filename: String,
    /// Database URL (overrides data_dir/database_filename if set).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Root of the filesystem object store.
    pub objects_dir: PathBuf,
    /// Bucket that incoming documents are uploaded to.
    pub bucket: String,
    /// Remote analysis service. `None` runs the in-process service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    pub service_timeout_secs: u64,
    /// How long an in-process job takes to finish.
    pub local_job_duration_ms: u64,
    /// Deadline for one synchronous analyze call.
    pub sync_timeout_secs: u64,
    /// Deadline for fetching every page of one job's result.
    pub result_fetch_budget_secs: u64,
    pub features: FeatureSet,
    pub notification: NotificationChannel,
    pub sync_queue: QueueSettings,
    pub async_queue: QueueSettings,
    pub results_queue: QueueSettings,
    pub poll: PollSettings,
    pub routing: RoutingPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ocrflow");

        Self {
            objects_dir: data_dir.join(OBJECTS_SUBDIR),
            data_dir,
            database_filename: DEFAULT_DATABASE_FILENAME.to_string(),
            database_url: None,
            bucket: "documents".to_string(),
            service_url: None,
            service_timeout_secs: 30,
            local_job_duration_ms: 500,
            sync_timeout_secs: 25,
            result_fetch_budget_secs: 840,
            features: FeatureSet::default(),
            notification: NotificationChannel {
                topic: "ocrflow-job-completions".to_string(),
                publisher_role: "ocrflow-analysis-publisher".to_string(),
            },
            sync_queue: QueueSettings::new(30, 1, 1),
            async_queue: QueueSettings::new(30, 10, 50),
            results_queue: QueueSettings::new(900, 10, 100),
            poll: PollSettings::default(),
            routing: RoutingPolicy::default(),
        }
    }
}

impl Settings {
    /// Create settings with a custom data directory.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            objects_dir: data_dir.join(OBJECTS_SUBDIR),
            data_dir,
            ..Default::default()
        }
    }

    /// Get the database URL, constructing from path if not explicitly set.
    pub fn database_url(&self) -> String {
        if let Some(ref url) = self.database_url {
            url.clone()
        } else {
            format!("sqlite:{}", self.database_path().display())
        }
    }

    /// Get the full path to the database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_filename)
    }

    /// Check if the database appears to be initialized.
    pub fn database_exists(&self) -> bool {
        self.database_url.is_some() || self.database_path().exists()
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn result_fetch_budget(&self) -> Duration {
        Duration::from_secs(self.result_fetch_budget_secs)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn local_job_duration(&self) -> Duration {
        Duration::from_millis(self.local_job_duration_ms)
    }

    /// Check the cross-field constraints the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync_queue.validate("sync")?;
        self.async_queue.validate("async")?;
        self.results_queue.validate("results")?;

        if self.sync_queue.concurrency != 1 {
            return Err(ConfigError::Invalid(
                "sync queue concurrency is fixed at 1".to_string(),
            ));
        }
        if self.sync_timeout() >= self.sync_queue.visibility_timeout() {
            return Err(ConfigError::Invalid(format!(
                "sync_timeout_secs ({}) must be shorter than the sync queue visibility timeout ({})",
                self.sync_timeout_secs, self.sync_queue.visibility_timeout_secs
            )));
        }
        if self.result_fetch_budget() >= self.results_queue.visibility_timeout() {
            return Err(ConfigError::Invalid(format!(
                "result_fetch_budget_secs ({}) must be shorter than the results queue visibility timeout ({})",
                self.result_fetch_budget_secs, self.results_queue.visibility_timeout_secs
            )));
        }
        if self.poll.interval_secs == 0 || self.poll.scan_limit == 0 || self.poll.status_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "poll interval_secs, scan_limit and status_concurrency must be at least 1".to_string(),
            ));
        }
        if self.bucket.is_empty() {
            return Err(ConfigError::Invalid("bucket must not be empty".to_string()));
        }
        Ok(())
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|s| !s.is_empty());

        if let Some(url) = var("DATABASE_URL") {
            tracing::debug!("Using DATABASE_URL from environment: {}", url);
            self.database_url = Some(url);
        }
        if let Some(url) = var("OCRFLOW_SERVICE_URL") {
            tracing::debug!("Using OCRFLOW_SERVICE_URL from environment: {}", url);
            self.service_url = Some(url);
        }
        if let Some(dir) = var("OCRFLOW_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
            self.objects_dir = self.data_dir.join(OBJECTS_SUBDIR);
        }
        if let Some(secs) = var("OCRFLOW_POLL_INTERVAL_SECS") {
            match secs.parse() {
                Ok(secs) => self.poll.interval_secs = secs,
                Err(_) => tracing::warn!("Ignoring invalid OCRFLOW_POLL_INTERVAL_SECS: {}", secs),
            }
        }
    }

    /// Render as TOML for display.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// Optional overrides for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_receive_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

impl QueueSection {
    fn apply(&self, queue: &mut QueueSettings) {
        if let Some(v) = self.visibility_timeout_secs {
            queue.visibility_timeout_secs = v;
        }
        if let Some(v) = self.max_receive_count {
            queue.max_receive_count = v;
        }
        if let Some(v) = self.batch_size {
            queue.batch_size = v;
        }
        if let Some(v) = self.concurrency {
            queue.concurrency = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuesSection {
    #[serde(default)]
    pub sync: QueueSection,
    #[serde(default, rename = "async")]
    pub async_: QueueSection,
    #[serde(default)]
    pub results: QueueSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_job_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_fetch_budget_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forms: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_concurrency: Option<usize>,
}

/// Configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    /// Database filename.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub queues: QueuesSection,
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingPolicy>,
    /// Path to the config file this was loaded from (not serialized).
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration using prefer crate for discovery.
    /// Automatically discovers ocrflow config files in standard locations.
    pub async fn load() -> Self {
        match prefer::load("ocrflow").await {
            Ok(pref_config) => match pref_config.source_path() {
                Some(path) => match Self::load_from_path(path).await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::warn!("Ignoring config file: {}", e);
                        Self::default()
                    }
                },
                None => Self::default(),
            },
            // No config file found
            Err(_) => Self::default(),
        }
    }

    /// Load configuration from a specific file path.
    /// Supports JSON, TOML and YAML based on file extension.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mut config = Self::parse(&contents, path)?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let parsed = match ext {
            "toml" => toml::from_str(contents).map_err(|e| e.to_string()),
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
            _ => serde_json::from_str(contents).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Get the base directory for resolving relative paths.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.source_path
            .as_ref()
            .and_then(|p| p.parent().map(|p| p.to_path_buf()))
    }

    /// Resolve a path that may be relative to the config file.
    pub fn resolve_path(&self, path_str: &str, base_dir: &Path) -> PathBuf {
        let expanded = match path_str.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(path_str)),
            None => PathBuf::from(path_str),
        };
        if expanded.is_absolute() {
            expanded
        } else {
            base_dir.join(expanded)
        }
    }

    /// Apply configuration to settings.
    /// `base_dir` is used to resolve relative paths (typically config file dir or CWD).
    pub fn apply_to_settings(&self, settings: &mut Settings, base_dir: &Path) {
        if let Some(ref data_dir) = self.data_dir {
            settings.data_dir = self.resolve_path(data_dir, base_dir);
            settings.objects_dir = settings.data_dir.join(OBJECTS_SUBDIR);
        }
        if let Some(ref database) = self.database {
            settings.database_filename = database.clone();
        }
        if let Some(ref bucket) = self.bucket {
            settings.bucket = bucket.clone();
        }

        let a = &self.analysis;
        if let Some(ref url) = a.service_url {
            settings.service_url = Some(url.clone());
        }
        if let Some(v) = a.service_timeout_secs {
            settings.service_timeout_secs = v;
        }
        if let Some(v) = a.local_job_duration_ms {
            settings.local_job_duration_ms = v;
        }
        if let Some(v) = a.sync_timeout_secs {
            settings.sync_timeout_secs = v;
        }
        if let Some(v) = a.result_fetch_budget_secs {
            settings.result_fetch_budget_secs = v;
        }
        if let Some(v) = a.forms {
            settings.features.forms = v;
        }
        if let Some(v) = a.tables {
            settings.features.tables = v;
        }
        if let Some(ref topic) = a.completion_topic {
            settings.notification.topic = topic.clone();
        }
        if let Some(ref role) = a.publisher_role {
            settings.notification.publisher_role = role.clone();
        }

        self.queues.sync.apply(&mut settings.sync_queue);
        self.queues.async_.apply(&mut settings.async_queue);
        self.queues.results.apply(&mut settings.results_queue);

        let p = &self.poll;
        if let Some(v) = p.interval_secs {
            settings.poll.interval_secs = v;
        }
        if let Some(v) = p.adaptive {
            settings.poll.adaptive = v;
        }
        if let Some(v) = p.max_interval_secs {
            settings.poll.max_interval_secs = v;
        }
        if let Some(v) = p.scan_limit {
            settings.poll.scan_limit = v;
        }
        if let Some(v) = p.status_concurrency {
            settings.poll.status_concurrency = v;
        }

        if let Some(ref routing) = self.routing {
            settings.routing = routing.clone();
        }
    }
}

/// Options for loading settings.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit config file path (overrides auto-discovery).
    pub config_path: Option<PathBuf>,
}

/// Load settings: defaults, then the config file, then the environment.
/// Returns (Settings, Config) tuple.
pub async fn load_settings_with_options(options: LoadOptions) -> Result<(Settings, Config), ConfigError> {
    let config = match options.config_path {
        Some(ref path) => Config::load_from_path(path).await?,
        None => Config::load().await,
    };

    let mut settings = Settings::default();
    let base_dir = config
        .base_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    config.apply_to_settings(&mut settings, &base_dir);
    settings.apply_env_with(|key| std::env::var(key).ok());
    settings.validate()?;

    if let Some(ref path) = config.source_path {
        tracing::debug!("Loaded config from {}", path.display());
    }
    Ok((settings, config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_deployment() {
        let s = Settings::default();
        assert_eq!(s.sync_queue.visibility_timeout_secs, 30);
        assert_eq!(s.results_queue.visibility_timeout_secs, 900);
        assert_eq!(s.sync_queue.max_receive_count, 50);
        assert_eq!(s.sync_timeout_secs, 25);
        assert_eq!(s.poll.interval_secs, 120);
        assert_eq!(s.sync_queue.concurrency, 1);
        assert_eq!(s.async_queue.concurrency, 50);
        assert_eq!(s.results_queue.concurrency, 100);
        assert_eq!(s.results_queue.batch_size, 10);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_sync_timeout_at_visibility() {
        let mut s = Settings::default();
        s.sync_timeout_secs = 30;
        assert!(matches!(s.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_queue_settings() {
        let mut s = Settings::default();
        s.results_queue.max_receive_count = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.async_queue.concurrency = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.sync_queue.concurrency = 4;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.result_fetch_budget_secs = 900;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_toml_config_applies() {
        let toml = r#"
            data_dir = "data"
            bucket = "scans"

            [analysis]
            sync_timeout_secs = 10
            tables = false

            [queues.async]
            concurrency = 8

            [queues.results]
            max_receive_count = 5

            [poll]
            interval_secs = 30
            adaptive = true
        "#;
        let config = Config::parse(toml, Path::new("ocrflow.toml")).unwrap();
        let mut s = Settings::default();
        config.apply_to_settings(&mut s, Path::new("/etc/ocrflow"));

        assert_eq!(s.data_dir, PathBuf::from("/etc/ocrflow/data"));
        assert_eq!(s.objects_dir, PathBuf::from("/etc/ocrflow/data/objects"));
        assert_eq!(s.bucket, "scans");
        assert_eq!(s.sync_timeout_secs, 10);
        assert!(!s.features.tables);
        assert!(s.features.forms);
        assert_eq!(s.async_queue.concurrency, 8);
        assert_eq!(s.results_queue.max_receive_count, 5);
        assert_eq!(s.poll.interval_secs, 30);
        assert!(s.poll.adaptive);
    }

    #[test]
    fn test_yaml_and_json_configs_parse() {
        let yaml = "bucket: inbox\nqueues:\n  sync:\n    visibility_timeout_secs: 60\n";
        let config = Config::parse(yaml, Path::new("ocrflow.yaml")).unwrap();
        assert_eq!(config.queues.sync.visibility_timeout_secs, Some(60));

        let json = r#"{"routing": {"sync_max_bytes": 1024}}"#;
        let config = Config::parse(json, Path::new("ocrflow.json")).unwrap();
        let routing = config.routing.unwrap();
        assert_eq!(routing.sync_max_bytes, 1024);
        assert_eq!(routing.sync_content_types, RoutingPolicy::default().sync_content_types);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = Config::parse("bucket = [", Path::new("broken.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref path, .. } if path == Path::new("broken.toml")));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "sqlite:/tmp/x.db"),
            ("OCRFLOW_SERVICE_URL", "http://ocr:8080"),
            ("OCRFLOW_DATA_DIR", "/srv/ocrflow"),
            ("OCRFLOW_POLL_INTERVAL_SECS", "15"),
        ]);
        let mut s = Settings::default();
        s.apply_env_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(s.database_url(), "sqlite:/tmp/x.db");
        assert_eq!(s.service_url.as_deref(), Some("http://ocr:8080"));
        assert_eq!(s.objects_dir, PathBuf::from("/srv/ocrflow/objects"));
        assert_eq!(s.poll.interval_secs, 15);
    }

    #[test]
    fn test_settings_render_as_toml() {
        let rendered = Settings::with_data_dir(PathBuf::from("/data")).to_toml().unwrap();
        assert!(rendered.contains("bucket = \"documents\""));
        assert!(rendered.contains("[results_queue]"));
        assert!(rendered.contains("visibility_timeout_secs = 900"));
    }

    #[tokio::test]
    async fn test_load_from_path_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ocrflow.toml");
        std::fs::write(&path, "database = \"jobs.db\"\n").unwrap();

        let config = Config::load_from_path(&path).await.unwrap();
        assert_eq!(config.database.as_deref(), Some("jobs.db"));
        assert_eq!(config.base_dir().as_deref(), Some(dir.path()));
    }
}
