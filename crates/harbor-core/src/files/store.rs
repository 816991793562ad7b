//! Durable file store seam.
//!
//! Every write is a compare-and-swap against the stored version. A batch is
//! checked as a whole under one lock and either committed entirely or not
//! at all.

use super::record::{content_hash, FileKind, FileRecord};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Version check applied to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// No live record may exist (missing or tombstoned).
    Absent,
    /// The stored version must equal this exactly.
    Version(u64),
    /// Unconditional.
    Any,
}

impl Precondition {
    /// Map a caller-supplied `expectedVersion`.
    pub fn expecting(version: Option<u64>) -> Self {
        version.map_or(Precondition::Absent, Precondition::Version)
    }
}

/// A single write inside a batch. `content = None` writes a tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct FileWrite {
    pub path: String,
    pub content: Option<String>,
    pub kind: FileKind,
    pub precondition: Precondition,
}

impl FileWrite {
    pub fn put(path: impl Into<String>, content: impl Into<String>, kind: FileKind, precondition: Precondition) -> Self {
        Self {
            path: path.into(),
            content: Some(content.into()),
            kind,
            precondition,
        }
    }

    pub fn delete(path: impl Into<String>, precondition: Precondition) -> Self {
        Self {
            path: path.into(),
            content: None,
            kind: FileKind::File,
            precondition,
        }
    }
}

/// Outcome of one write in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Applied(FileRecord),
    /// Precondition failed; carries the version the writer should refetch.
    Conflict { current_version: Option<u64> },
    /// Delete of a missing or tombstoned path.
    NotFound,
    /// Valid on its own but not committed because another entry failed.
    Skipped,
}

/// Result of [`FileStore::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    /// Whether the batch was committed.
    pub committed: bool,
    /// One outcome per write, in order.
    pub outcomes: Vec<WriteOutcome>,
}

/// Versioned, tombstone-aware storage for project files.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Latest record at `path`, tombstones included.
    async fn get(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>>;

    /// Latest record of every path in the project, tombstones included,
    /// ordered by path.
    async fn list(&self, project_id: &str) -> Result<Vec<FileRecord>>;

    /// Apply `writes` atomically. Duplicate paths chain: each entry sees the
    /// result of the previous one.
    async fn apply(&self, project_id: &str, writes: &[FileWrite]) -> Result<BatchOutcome>;

    /// Single compare-and-swap write.
    async fn compare_and_swap(&self, project_id: &str, write: FileWrite) -> Result<FileRecord> {
        let path = write.path.clone();
        let outcome = self.apply(project_id, std::slice::from_ref(&write)).await?;
        match outcome.outcomes.into_iter().next() {
            Some(WriteOutcome::Applied(record)) => Ok(record),
            Some(WriteOutcome::Conflict { current_version }) => {
                Err(CoreError::ConcurrencyConflict {
                    path,
                    current_version,
                })
            }
            Some(WriteOutcome::NotFound) => Err(CoreError::FileNotFound(path)),
            Some(WriteOutcome::Skipped) | None => Err(CoreError::Store(format!(
                "write to {path} was not committed"
            ))),
        }
    }
}

/// Check one write against `current` and build the next record.
pub(crate) fn evaluate_write(
    project_id: &str,
    current: Option<&FileRecord>,
    write: &FileWrite,
) -> std::result::Result<FileRecord, WriteOutcome> {
    let current_version = current.map(|r| r.version);
    let satisfied = match write.precondition {
        Precondition::Any => true,
        Precondition::Absent => current.map_or(true, FileRecord::is_tombstone),
        Precondition::Version(v) => current_version == Some(v),
    };
    if !satisfied {
        return Err(WriteOutcome::Conflict { current_version });
    }
    if write.content.is_none() && current.map_or(true, FileRecord::is_tombstone) {
        return Err(WriteOutcome::NotFound);
    }

    Ok(FileRecord {
        project_id: project_id.to_string(),
        path: write.path.clone(),
        content_hash: write.content.as_deref().map(content_hash),
        content: write.content.clone(),
        kind: write.kind,
        version: current_version.map_or(1, |v| v + 1),
        updated_at: Utc::now(),
    })
}

/// In-memory [`FileStore`].
#[derive(Default)]
pub struct MemoryFileStore {
    projects: RwLock<HashMap<String, BTreeMap<String, FileRecord>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .projects
            .read()
            .await
            .get(project_id)
            .and_then(|files| files.get(path))
            .cloned())
    }

    async fn list(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        Ok(self
            .projects
            .read()
            .await
            .get(project_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn apply(&self, project_id: &str, writes: &[FileWrite]) -> Result<BatchOutcome> {
        let mut projects = self.projects.write().await;
        let files = projects.get(project_id);

        let mut staged: HashMap<&str, FileRecord> = HashMap::new();
        let mut outcomes = Vec::with_capacity(writes.len());
        let mut committed = true;

        for write in writes {
            let current = staged
                .get(write.path.as_str())
                .or_else(|| files.and_then(|files| files.get(&write.path)));
            match evaluate_write(project_id, current, write) {
                Ok(record) => {
                    outcomes.push(WriteOutcome::Applied(record.clone()));
                    staged.insert(write.path.as_str(), record);
                }
                Err(outcome) => {
                    committed = false;
                    outcomes.push(outcome);
                }
            }
        }

        if committed && !staged.is_empty() {
            let files = projects.entry(project_id.to_string()).or_default();
            for (path, record) in staged {
                files.insert(path.to_string(), record);
            }
        } else if !committed {
            for outcome in &mut outcomes {
                if matches!(outcome, WriteOutcome::Applied(_)) {
                    *outcome = WriteOutcome::Skipped;
                }
            }
        }

        Ok(BatchOutcome {
            committed,
            outcomes,
        })
    }
}
