//! Applies remote file events to the local workspace.

use harbor_core::files::{normalize_path, resolve_in, FileKind};
use harbor_core::realtime::{
    BroadcastMessage, ChangeAction, EventPayload, FileDelete, FileUpdate, HotReloadHandle,
};
use harbor_core::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Message ids remembered for duplicate suppression.
const SEEN_CAPACITY: usize = 1024;

/// What happened to one incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Paths written or removed.
    Changed(Vec<String>),
    /// Already seen, older than what is on disk, or not a file event.
    Skipped,
}

/// Writes `file:*` events under the workspace root.
///
/// Replays are harmless: message ids are remembered and per-path versions
/// only move forward.
pub struct LocalApplier {
    root: PathBuf,
    reload: Option<HotReloadHandle>,
    versions: HashMap<String, u64>,
    seen: HashSet<Uuid>,
    seen_order: VecDeque<Uuid>,
}

impl LocalApplier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            reload: None,
            versions: HashMap::new(),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Report applied changes to the hot reload coordinator.
    pub fn with_reload(mut self, handle: HotReloadHandle) -> Self {
        self.reload = Some(handle);
        self
    }

    pub async fn apply(&mut self, message: &BroadcastMessage) -> Result<Applied> {
        if !self.remember(message.id) {
            tracing::debug!(id = %message.id, "Duplicate message skipped");
            return Ok(Applied::Skipped);
        }

        match &message.body {
            EventPayload::FileUpdate(update) => Ok(self.apply_update(update).await?.into()),
            EventPayload::FileDelete(delete) => Ok(self.apply_delete(delete).await?.into()),
            EventPayload::FileBulkUpdate(bulk) => {
                let mut changed = Vec::new();
                for change in &bulk.files {
                    let path = match change.action {
                        ChangeAction::Update => {
                            let content = change.content.as_deref().unwrap_or_default();
                            self.write(&change.file_path, content, change.kind).await?
                        }
                        ChangeAction::Delete => self.remove(&change.file_path).await?,
                    };
                    changed.push(path);
                }
                Ok(Applied::Changed(changed))
            }
            EventPayload::HotReload(_) | EventPayload::SessionStatus(_) => Ok(Applied::Skipped),
        }
    }

    async fn apply_update(&mut self, update: &FileUpdate) -> Result<Option<String>> {
        if self.is_stale(&update.file_path, update.version)? {
            return Ok(None);
        }
        let path = self
            .write(&update.file_path, &update.content, update.kind)
            .await?;
        if let Some(version) = update.version {
            self.versions.insert(path.clone(), version);
        }
        Ok(Some(path))
    }

    async fn apply_delete(&mut self, delete: &FileDelete) -> Result<Option<String>> {
        if self.is_stale(&delete.file_path, delete.version)? {
            return Ok(None);
        }
        let path = self.remove(&delete.file_path).await?;
        if let Some(version) = delete.version {
            self.versions.insert(path.clone(), version);
        }
        Ok(Some(path))
    }

    fn is_stale(&self, path: &str, version: Option<u64>) -> Result<bool> {
        let (Some(version), path) = (version, normalize_path(path)?) else {
            return Ok(false);
        };
        let stale = self.versions.get(&path).is_some_and(|&seen| version <= seen);
        if stale {
            tracing::debug!(path = %path, version, "Stale file event skipped");
        }
        Ok(stale)
    }

    async fn write(&self, path: &str, content: &str, kind: FileKind) -> Result<String> {
        let normalized = normalize_path(path)?;
        let target = resolve_in(&self.root, &normalized)?;
        let bytes = kind.decode(content)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &bytes).await?;
        tracing::debug!(path = %normalized, bytes = bytes.len(), "File written");

        if let Some(reload) = &self.reload {
            reload.observe(normalized.clone(), &bytes).await;
        }
        Ok(normalized)
    }

    async fn remove(&self, path: &str) -> Result<String> {
        let normalized = normalize_path(path)?;
        let target = resolve_in(&self.root, &normalized)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => tracing::debug!(path = %normalized, "File removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(reload) = &self.reload {
            reload.observe_removed(normalized.clone()).await;
        }
        Ok(normalized)
    }

    fn remember(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Seed the coordinator with every file under `root`, skipping ignored
/// directories. Returns the number of files seeded.
pub async fn seed_workspace(
    root: &Path,
    handle: &HotReloadHandle,
    ignored_dirs: &[String],
) -> Result<usize> {
    let mut seeded = 0;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let name = entry.file_name();
                if !ignored_dirs.iter().any(|d| name.to_str() == Some(d.as_str())) {
                    pending.push(path);
                }
            } else if file_type.is_file() {
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                let content = tokio::fs::read(&path).await?;
                handle.seed(relative, &content).await;
                seeded += 1;
            }
        }
    }
    tracing::debug!(root = %root.display(), seeded, "Workspace hashes seeded");
    Ok(seeded)
}

impl From<Option<String>> for Applied {
    fn from(path: Option<String>) -> Self {
        match path {
            Some(path) => Applied::Changed(vec![path]),
            None => Applied::Skipped,
        }
    }
}
