//! Sandbox hydration.
//!
//! A [`Hydrator`] tries an ordered list of [`HydrationStrategy`]s until one
//! writes at least one file. A failing or empty stage hands over to the
//! next; if every stage comes up empty a minimal project scaffold is
//! written so the sandbox always has something runnable.

use super::record::{resolve_in, FileRecord};
use super::service::RecordSource;
use super::snapshot::extract_archive;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use harbor_machine::{RetryPolicy, Retryable};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Snapshot download tuning.
#[derive(Debug, Clone)]
pub struct HydrationConfig {
    /// Download attempts before falling back.
    pub snapshot_attempts: u32,
    /// Timeout for each download attempt, independent of backoff.
    pub attempt_timeout: Duration,
    /// Backoff after the first failed attempt.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            snapshot_attempts: 5,
            attempt_timeout: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl HydrationConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_attempts(self.snapshot_attempts).delays(self.base_delay, self.max_delay)
    }
}

/// One way of populating a sandbox directory.
#[async_trait]
pub trait HydrationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write the project's files under `dest`. `Ok(0)` means this source
    /// has nothing for the project.
    async fn hydrate(&self, project_id: &str, dest: &Path) -> Result<usize>;
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) => true,
            FetchError::Status(code) => *code >= 500 || *code == 408 || *code == 429,
        }
    }
}

/// Downloads and extracts a pre-built snapshot archive.
pub struct SnapshotStrategy {
    url: String,
    http: reqwest::Client,
    config: HydrationConfig,
}

impl SnapshotStrategy {
    pub fn new(url: impl Into<String>, config: HydrationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CoreError::Hydration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            config,
        })
    }

    async fn download(&self) -> std::result::Result<Vec<u8>, FetchError> {
        let timeout = self.config.attempt_timeout;
        let fetch = async {
            let response = self
                .http
                .get(&self.url)
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| FetchError::Transport(e.to_string()))
        };
        tokio::time::timeout(timeout, fetch)
            .await
            .map_err(|_| FetchError::Timeout(timeout))?
    }
}

#[async_trait]
impl HydrationStrategy for SnapshotStrategy {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn hydrate(&self, project_id: &str, dest: &Path) -> Result<usize> {
        let bytes = self
            .config
            .retry_policy()
            .run("snapshot_download", || self.download())
            .await
            .map_err(|e| CoreError::Hydration(format!("snapshot download from {} failed: {e}", self.url)))?;
        tracing::debug!(project_id, bytes = bytes.len(), "Snapshot downloaded");

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&bytes, &dest))
            .await
            .map_err(|e| CoreError::Hydration(format!("extract task failed: {e}")))?
    }
}

/// Durable object storage holding individual project files.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Keys under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn download(&self, key: &str) -> Result<Vec<u8>>;
}

/// Object storage backed by a map, for local runs and tests.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: std::sync::RwLock<std::collections::BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(key.into(), data.into());
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, std::collections::BTreeMap<String, Vec<u8>>>> {
        self.objects
            .read()
            .map_err(|_| CoreError::Store("object storage lock poisoned".into()))
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .read()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| CoreError::FileNotFound(key.to_string()))
    }
}

/// Storage key prefix for a project's files.
pub fn storage_prefix(project_id: &str) -> String {
    format!("projects/{project_id}/files/")
}

/// Lists and downloads individual files from object storage.
pub struct StorageStrategy {
    storage: Arc<dyn ObjectStorage>,
}

impl StorageStrategy {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl HydrationStrategy for StorageStrategy {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn hydrate(&self, project_id: &str, dest: &Path) -> Result<usize> {
        let prefix = storage_prefix(project_id);
        let keys = self.storage.list(&prefix).await?;
        let mut written = 0;
        for key in keys {
            let relative = key.strip_prefix(&prefix).unwrap_or(&key);
            let data = self.storage.download(&key).await?;
            write_file(dest, relative, &data).await?;
            written += 1;
        }
        Ok(written)
    }
}

/// Reads current records through the versioned file API.
pub struct RecordsStrategy {
    source: Arc<dyn RecordSource>,
}

impl RecordsStrategy {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl HydrationStrategy for RecordsStrategy {
    fn name(&self) -> &'static str {
        "records"
    }

    async fn hydrate(&self, project_id: &str, dest: &Path) -> Result<usize> {
        let records = self.source.current_records(project_id).await?;
        write_records(dest, &records).await
    }
}

/// Write live records under `dest`. Returns the number written.
pub async fn write_records(dest: &Path, records: &[FileRecord]) -> Result<usize> {
    let mut written = 0;
    for record in records {
        if let Some(content) = &record.content {
            write_file(dest, &record.path, &record.kind.decode(content)?).await?;
            written += 1;
        }
    }
    Ok(written)
}

/// Writes a minimal Vite-style project.
pub struct ScaffoldStrategy;

const SCAFFOLD: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{
  "name": "preview",
  "private": true,
  "type": "module",
  "scripts": {
    "dev": "vite --host 0.0.0.0 --port 3000"
  },
  "devDependencies": {
    "vite": "^5.0.0"
  }
}
"#,
    ),
    (
        "index.html",
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>Preview</title>
  </head>
  <body>
    <div id="app"></div>
    <script type="module" src="/src/main.js"></script>
  </body>
</html>
"#,
    ),
    (
        "src/main.js",
        "document.querySelector('#app').textContent = 'Your project is empty. Add some files to get started.';\n",
    ),
];

#[async_trait]
impl HydrationStrategy for ScaffoldStrategy {
    fn name(&self) -> &'static str {
        "scaffold"
    }

    async fn hydrate(&self, _project_id: &str, dest: &Path) -> Result<usize> {
        for (path, content) in SCAFFOLD {
            write_file(dest, path, content.as_bytes()).await?;
        }
        Ok(SCAFFOLD.len())
    }
}

async fn write_file(dest: &Path, path: &str, data: &[u8]) -> Result<PathBuf> {
    let target = resolve_in(dest, path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, data).await?;
    Ok(target)
}

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Hydrated(usize),
    Empty,
    Failed(String),
}

/// One stage of a hydration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttempt {
    pub strategy: &'static str,
    pub outcome: StageOutcome,
    pub elapsed: Duration,
}

/// Summary of a hydration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HydrationReport {
    /// Strategy that produced the files.
    pub source: &'static str,
    pub files_written: usize,
    pub attempts: Vec<StageAttempt>,
}

/// Ordered fallback chain ending in the default scaffold.
#[derive(Default)]
pub struct Hydrator {
    strategies: Vec<Box<dyn HydrationStrategy>>,
}

impl Hydrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn with(mut self, strategy: impl HydrationStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Names of the configured stages, in order.
    pub fn stages(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Populate `dest`. Fails only if the scaffold itself cannot be written.
    pub async fn hydrate(&self, project_id: &str, dest: &Path) -> Result<HydrationReport> {
        tokio::fs::create_dir_all(dest).await?;
        let mut attempts = Vec::new();

        for strategy in &self.strategies {
            let started = Instant::now();
            let outcome = match strategy.hydrate(project_id, dest).await {
                Ok(0) => {
                    tracing::info!(project_id, strategy = strategy.name(), "Hydration source empty, falling back");
                    StageOutcome::Empty
                }
                Ok(files) => StageOutcome::Hydrated(files),
                Err(e) => {
                    tracing::warn!(project_id, strategy = strategy.name(), error = %e, "Hydration stage failed, falling back");
                    StageOutcome::Failed(e.to_string())
                }
            };
            attempts.push(StageAttempt {
                strategy: strategy.name(),
                outcome: outcome.clone(),
                elapsed: started.elapsed(),
            });

            if let StageOutcome::Hydrated(files_written) = outcome {
                tracing::info!(project_id, strategy = strategy.name(), files = files_written, "Sandbox hydrated");
                return Ok(HydrationReport {
                    source: strategy.name(),
                    files_written,
                    attempts,
                });
            }
        }

        let started = Instant::now();
        let files_written = ScaffoldStrategy.hydrate(project_id, dest).await?;
        attempts.push(StageAttempt {
            strategy: ScaffoldStrategy.name(),
            outcome: StageOutcome::Hydrated(files_written),
            elapsed: started.elapsed(),
        });
        tracing::warn!(project_id, "No project files found, wrote default scaffold");
        Ok(HydrationReport {
            source: ScaffoldStrategy.name(),
            files_written,
            attempts,
        })
    }
}
