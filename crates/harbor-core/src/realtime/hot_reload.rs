//! Hot-reload coordination.
//!
//! Local changes are detected by content hash, so a write that leaves the
//! bytes unchanged never triggers a reload. Relevant changes are collected
//! over a trailing debounce window and flushed as a single `hot_reload`
//! broadcast followed by an optional rebuild request. A steady stream of
//! changes still flushes once `max_wait` has passed since the first one.

use super::bus::{ChannelBus, PublishOptions};
use super::message::{EventPayload, HotReload};
use super::policy::Subject;
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    /// Quiet period after the last relevant change before flushing.
    pub debounce: Duration,
    /// Longest a pending batch waits, measured from its first change.
    pub max_wait: Duration,
    /// Commands buffered before senders wait for the coordinator.
    pub queue_capacity: usize,
    /// File extensions that warrant a reload (without the dot).
    pub extensions: Vec<String>,
    /// Path segments whose contents are never considered.
    pub ignored_dirs: Vec<String>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        let extensions = [
            "ts", "tsx", "js", "jsx", "mjs", "cjs", "css", "scss", "html", "json", "vue", "svelte",
        ];
        Self {
            debounce: Duration::from_secs(1),
            max_wait: Duration::from_secs(5),
            queue_capacity: 1024,
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            ignored_dirs: ["node_modules", ".git", "dist"]
                .iter()
                .map(|d| d.to_string())
                .collect(),
        }
    }
}

impl HotReloadConfig {
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Whether a change at `path` should contribute to a reload.
    pub fn is_relevant(&self, path: &str) -> bool {
        if path
            .split('/')
            .any(|seg| self.ignored_dirs.iter().any(|d| d == seg))
        {
            return false;
        }
        let file_name = path.rsplit('/').next().unwrap_or(path);
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }
}

/// Destination for reload broadcasts.
#[async_trait]
pub trait ReloadPublisher: Send + Sync {
    async fn publish_reload(&self, event: HotReload) -> Result<()>;
}

/// Asks the dev server (or bundler) to rebuild.
#[async_trait]
pub trait RebuildTrigger: Send + Sync {
    async fn rebuild(&self, changed_files: &[String]) -> Result<()>;
}

/// Publishes reloads on `project:{id}:reload` through a local bus.
pub struct BusReloadPublisher {
    bus: ChannelBus,
    subject: Subject,
}

impl BusReloadPublisher {
    pub fn new(bus: ChannelBus, subject: Subject) -> Self {
        Self { bus, subject }
    }
}

#[async_trait]
impl ReloadPublisher for BusReloadPublisher {
    async fn publish_reload(&self, event: HotReload) -> Result<()> {
        let channel = format!("project:{}:reload", event.project_id);
        self.bus.publish(
            &channel,
            &self.subject,
            EventPayload::HotReload(event),
            PublishOptions::default(),
        )?;
        Ok(())
    }
}

enum Command {
    Seed(String, blake3::Hash),
    Changed(String, blake3::Hash),
    Removed(String),
}

/// Cloneable handle feeding the coordinator task.
///
/// The queue is bounded, so callers wait while it is full. The task flushes
/// any pending batch and exits when every handle is dropped.
#[derive(Clone)]
pub struct HotReloadHandle {
    tx: mpsc::Sender<Command>,
}

impl HotReloadHandle {
    /// Record a file's current content without triggering a reload.
    pub async fn seed(&self, path: impl Into<String>, content: &[u8]) {
        self.send(Command::Seed(path.into(), blake3::hash(content)))
            .await;
    }

    /// Report that `path` now holds `content`.
    pub async fn observe(&self, path: impl Into<String>, content: &[u8]) {
        self.send(Command::Changed(path.into(), blake3::hash(content)))
            .await;
    }

    /// Report that `path` was removed.
    pub async fn observe_removed(&self, path: impl Into<String>) {
        self.send(Command::Removed(path.into())).await;
    }

    async fn send(&self, command: Command) {
        if self.tx.send(command).await.is_err() {
            tracing::debug!("Hot reload coordinator gone, change dropped");
        }
    }
}

/// Debounces local changes into reload broadcasts.
pub struct HotReloadCoordinator {
    project_id: String,
    config: HotReloadConfig,
    publisher: Arc<dyn ReloadPublisher>,
    trigger: Option<Arc<dyn RebuildTrigger>>,
    hashes: HashMap<String, blake3::Hash>,
    pending: BTreeSet<String>,
    first_change: Option<Instant>,
    deadline: Option<Instant>,
}

impl HotReloadCoordinator {
    /// Start the coordinator task.
    pub fn spawn(
        project_id: impl Into<String>,
        config: HotReloadConfig,
        publisher: Arc<dyn ReloadPublisher>,
        trigger: Option<Arc<dyn RebuildTrigger>>,
    ) -> (HotReloadHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let coordinator = Self {
            project_id: project_id.into(),
            config,
            publisher,
            trigger,
            hashes: HashMap::new(),
            pending: BTreeSet::new(),
            first_change: None,
            deadline: None,
        };
        let task = tokio::spawn(coordinator.run(rx));
        (HotReloadHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush().await;
                }
            }
        }
        self.flush().await;
        tracing::debug!(project_id = %self.project_id, "Hot reload coordinator stopped");
    }

    fn apply(&mut self, command: Command) {
        let path = match command {
            Command::Seed(path, hash) => {
                self.hashes.insert(path, hash);
                return;
            }
            Command::Changed(path, hash) => {
                if self.hashes.get(&path) == Some(&hash) {
                    tracing::trace!(path = %path, "Content unchanged, ignoring");
                    return;
                }
                self.hashes.insert(path.clone(), hash);
                path
            }
            Command::Removed(path) => {
                if self.hashes.remove(&path).is_none() {
                    return;
                }
                path
            }
        };

        if !self.config.is_relevant(&path) {
            tracing::trace!(path = %path, "Change filtered out");
            return;
        }
        self.pending.insert(path);
        let now = Instant::now();
        let first_change = *self.first_change.get_or_insert(now);
        let trailing = now + self.config.debounce;
        self.deadline = Some(trailing.min(first_change + self.config.max_wait));
    }

    async fn flush(&mut self) {
        self.deadline = None;
        self.first_change = None;
        if self.pending.is_empty() {
            return;
        }
        let changed_files: Vec<String> = std::mem::take(&mut self.pending).into_iter().collect();
        tracing::info!(
            project_id = %self.project_id,
            files = changed_files.len(),
            "Publishing hot reload"
        );

        let event = HotReload {
            project_id: self.project_id.clone(),
            changed_files: changed_files.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.publisher.publish_reload(event).await {
            tracing::warn!(project_id = %self.project_id, error = %e, "Hot reload publish failed");
        }
        if let Some(trigger) = &self.trigger {
            if let Err(e) = trigger.rebuild(&changed_files).await {
                tracing::warn!(project_id = %self.project_id, error = %e, "Rebuild request failed");
            }
        }
    }
}
