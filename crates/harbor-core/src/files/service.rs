//! File synchronization service.

use super::record::{normalize_path, FileKind, FileRecord, FileSummary};
use super::snapshot::{build_archive, read_archive};
use super::store::{FileStore, FileWrite, Precondition, WriteOutcome};
use crate::error::{CoreError, Result};
use crate::realtime::{
    files_channel, BulkFileChange, ChangeAction, ChannelBus, EventPayload, FileBulkUpdate,
    FileDelete, FileUpdate, PublishOptions, Subject,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// One entry of a bulk request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEntry {
    pub path: String,
    #[serde(flatten)]
    pub action: BulkAction,
    /// Checked when present; the entry is unconditional otherwise.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum BulkAction {
    Update {
        content: String,
        #[serde(default, rename = "type")]
        kind: FileKind,
    },
    Delete,
}

impl BulkEntry {
    pub fn update(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: BulkAction::Update {
                content: content.into(),
                kind: FileKind::File,
            },
            expected_version: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: BulkAction::Delete,
            expected_version: None,
        }
    }

    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Per-entry outcome of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum BulkOutcome {
    Applied {
        version: u64,
    },
    Conflict {
        #[serde(rename = "currentVersion")]
        current_version: Option<u64>,
    },
    NotFound,
    /// Valid but not committed because another entry failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkEntryResult {
    pub path: String,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

/// Result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkResult {
    /// Entries examined.
    pub processed: usize,
    /// Entries committed (0 when the batch was rejected).
    pub upserted: usize,
    /// Whether the batch was committed.
    pub applied: bool,
    pub results: Vec<BulkEntryResult>,
}

/// Source of a project's current records, consulted by hydration.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn current_records(&self, project_id: &str) -> Result<Vec<FileRecord>>;
}

/// Versioned file operations plus change notifications.
///
/// Accepted writes are announced on `project:{id}:files` when a bus is
/// attached. A notification refused by the rate limiter is retried once the
/// window reopens with the latest stored state of that path, so the final
/// state of a burst is always delivered.
#[derive(Clone)]
pub struct FileSyncService {
    store: Arc<dyn FileStore>,
    bus: Option<ChannelBus>,
    subject: Subject,
    trailing: Arc<DashMap<(String, String), ()>>,
}

impl FileSyncService {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            bus: None,
            subject: Subject::system("harbor-files"),
            trailing: Arc::new(DashMap::new()),
        }
    }

    /// Publish change events on `bus`.
    pub fn with_bus(mut self, bus: ChannelBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Create or update a file.
    ///
    /// `expected_version` must be `None` when no live record exists and
    /// must equal the stored version otherwise.
    pub async fn upsert(
        &self,
        project_id: &str,
        path: &str,
        content: impl Into<String>,
        kind: FileKind,
        expected_version: Option<u64>,
    ) -> Result<FileSummary> {
        let path = normalize_path(path)?;
        let write = FileWrite::put(
            path,
            content,
            kind,
            Precondition::expecting(expected_version),
        );
        let record = self.store.compare_and_swap(project_id, write).await?;
        tracing::debug!(
            project_id,
            path = %record.path,
            version = record.version,
            "File upserted"
        );
        self.announce(&record);
        Ok(record.summary())
    }

    /// Tombstone a file. `expected_version = None` deletes unconditionally.
    pub async fn delete(
        &self,
        project_id: &str,
        path: &str,
        expected_version: Option<u64>,
    ) -> Result<FileRecord> {
        let path = normalize_path(path)?;
        let precondition = expected_version.map_or(Precondition::Any, Precondition::Version);
        let record = self
            .store
            .compare_and_swap(project_id, FileWrite::delete(path, precondition))
            .await?;
        tracing::debug!(
            project_id,
            path = %record.path,
            version = record.version,
            "File tombstoned"
        );
        self.announce(&record);
        Ok(record)
    }

    /// Latest record at `path`; tombstones only when asked for.
    pub async fn get(
        &self,
        project_id: &str,
        path: &str,
        include_tombstones: bool,
    ) -> Result<Option<FileRecord>> {
        let path = normalize_path(path)?;
        let record = self.store.get(project_id, &path).await?;
        Ok(record.filter(|r| include_tombstones || !r.is_tombstone()))
    }

    /// Live records of the project, ordered by path.
    pub async fn list_current(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        let mut records: Vec<_> = self
            .store
            .list(project_id)
            .await?
            .into_iter()
            .filter(|r| !r.is_tombstone())
            .collect();
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    /// Apply `entries` as one all-or-nothing batch.
    pub async fn bulk_upsert(&self, project_id: &str, entries: Vec<BulkEntry>) -> Result<BulkResult> {
        let mut writes = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = normalize_path(&entry.path)?;
            let precondition = entry
                .expected_version
                .map_or(Precondition::Any, Precondition::Version);
            writes.push(match entry.action {
                BulkAction::Update { content, kind } => {
                    FileWrite::put(path, content, kind, precondition)
                }
                BulkAction::Delete => FileWrite::delete(path, precondition),
            });
        }

        let batch = self.store.apply(project_id, &writes).await?;
        let mut applied_records = Vec::new();
        let results: Vec<BulkEntryResult> = writes
            .iter()
            .zip(batch.outcomes)
            .map(|(write, outcome)| BulkEntryResult {
                path: write.path.clone(),
                outcome: match outcome {
                    WriteOutcome::Applied(record) => {
                        let version = record.version;
                        applied_records.push(record);
                        BulkOutcome::Applied { version }
                    }
                    WriteOutcome::Conflict { current_version } => {
                        BulkOutcome::Conflict { current_version }
                    }
                    WriteOutcome::NotFound => BulkOutcome::NotFound,
                    WriteOutcome::Skipped => BulkOutcome::Skipped,
                },
            })
            .collect();

        if batch.committed {
            tracing::info!(project_id, files = applied_records.len(), "Bulk update applied");
            self.announce_bulk(project_id, &applied_records);
        } else {
            tracing::info!(project_id, entries = results.len(), "Bulk update rejected");
        }

        Ok(BulkResult {
            processed: results.len(),
            upserted: applied_records.len(),
            applied: batch.committed,
            results,
        })
    }

    /// Package the project's live files as a snapshot archive.
    pub async fn export_snapshot(&self, project_id: &str) -> Result<Vec<u8>> {
        let records = self.list_current(project_id).await?;
        let project = project_id.to_string();
        let bytes = tokio::task::spawn_blocking(move || build_archive(&project, &records))
            .await
            .map_err(|e| CoreError::Snapshot(format!("archive task failed: {e}")))??;
        tracing::info!(project_id, bytes = bytes.len(), "Snapshot exported");
        Ok(bytes)
    }

    /// Write every file of a snapshot archive as one unconditional batch.
    pub async fn import_snapshot(&self, project_id: &str, archive: Vec<u8>) -> Result<BulkResult> {
        let snapshot = tokio::task::spawn_blocking(move || read_archive(&archive))
            .await
            .map_err(|e| CoreError::Snapshot(format!("archive task failed: {e}")))??;
        if snapshot.manifest.project_id != project_id {
            tracing::warn!(
                project_id,
                archive_project = %snapshot.manifest.project_id,
                "Importing snapshot from another project"
            );
        }

        let entries = snapshot
            .files
            .into_iter()
            .map(|(path, bytes)| {
                let (kind, content) = FileKind::encode(&bytes);
                BulkEntry {
                    path,
                    action: BulkAction::Update { content, kind },
                    expected_version: None,
                }
            })
            .collect();
        self.bulk_upsert(project_id, entries).await
    }

    fn announce(&self, record: &FileRecord) {
        let Some(bus) = &self.bus else {
            return;
        };
        let payload = change_event(record);
        let channel = files_channel(&record.project_id);
        match bus.publish(&channel, &self.subject, payload, PublishOptions::key(&record.path)) {
            Ok(_) => {}
            Err(CoreError::RateLimited { retry_after }) => {
                self.schedule_trailing(&record.project_id, &record.path, retry_after);
            }
            Err(e) => {
                tracing::warn!(channel = %channel, path = %record.path, error = %e, "File event not published");
            }
        }
    }

    fn announce_bulk(&self, project_id: &str, records: &[FileRecord]) {
        let Some(bus) = &self.bus else {
            return;
        };
        if records.is_empty() {
            return;
        }
        let files = records
            .iter()
            .map(|r| BulkFileChange {
                file_path: r.path.clone(),
                action: if r.is_tombstone() {
                    ChangeAction::Delete
                } else {
                    ChangeAction::Update
                },
                content: r.content.clone(),
                kind: r.kind,
            })
            .collect();
        let payload = EventPayload::FileBulkUpdate(FileBulkUpdate {
            files,
            timestamp: Utc::now(),
        });
        let channel = files_channel(project_id);
        match bus.publish(&channel, &self.subject, payload, PublishOptions::default()) {
            Ok(_) => {}
            Err(CoreError::RateLimited { retry_after }) => {
                for record in records {
                    self.schedule_trailing(project_id, &record.path, retry_after);
                }
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Bulk event not published");
            }
        }
    }

    /// Re-announce the latest state of `path` after `delay`, at most once
    /// per path at a time.
    fn schedule_trailing(&self, project_id: &str, path: &str, delay: Duration) {
        let key = (project_id.to_string(), path.to_string());
        if self.trailing.insert(key.clone(), ()).is_some() {
            return;
        }
        tracing::debug!(project_id, path, delay_ms = delay.as_millis() as u64, "Trailing file event scheduled");

        let service = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            service.trailing.remove(&key);
            match service.store.get(&key.0, &key.1).await {
                Ok(Some(record)) => service.announce(&record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(project_id = %key.0, path = %key.1, error = %e, "Trailing event lookup failed");
                }
            }
        });
    }
}

fn change_event(record: &FileRecord) -> EventPayload {
    match &record.content {
        Some(content) => EventPayload::FileUpdate(FileUpdate {
            file_path: record.path.clone(),
            content: content.clone(),
            kind: record.kind,
            version: Some(record.version),
            timestamp: record.updated_at,
        }),
        None => EventPayload::FileDelete(FileDelete {
            file_path: record.path.clone(),
            version: Some(record.version),
            timestamp: record.updated_at,
        }),
    }
}

#[async_trait]
impl RecordSource for FileSyncService {
    async fn current_records(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        self.list_current(project_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::store::MemoryFileStore;
    use crate::realtime::{AccessPolicySet, BusConfig, RateLimitConfig, RateLimiter, Role};

    fn service() -> FileSyncService {
        FileSyncService::new(Arc::new(MemoryFileStore::new()))
    }

    fn bus() -> ChannelBus {
        ChannelBus::new(
            AccessPolicySet::default(),
            RateLimiter::new(RateLimitConfig::default()),
            BusConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_upsert_versions_and_conflict() {
        let svc = service();
        let v1 = svc.upsert("P1", "a.ts", "v1", FileKind::File, None).await.unwrap();
        assert_eq!(v1.version, 1);
        let v2 = svc.upsert("P1", "a.ts", "v2", FileKind::File, Some(1)).await.unwrap();
        assert_eq!(v2.version, 2);
        assert_ne!(v1.content_hash, v2.content_hash);

        let err = svc
            .upsert("P1", "a.ts", "v3", FileKind::File, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ConcurrencyConflict { current_version: Some(2), .. }
        ));
        // Creating over a live record without a version is also stale
        assert!(svc.upsert("P1", "a.ts", "v4", FileKind::File, None).await.is_err());
    }

    #[tokio::test]
    async fn test_tombstones_hidden_from_listing() {
        let svc = service();
        svc.upsert("P1", "a.ts", "a", FileKind::File, None).await.unwrap();
        svc.upsert("P1", "b.ts", "b", FileKind::File, None).await.unwrap();
        let tomb = svc.delete("P1", "./a.ts", Some(1)).await.unwrap();
        assert_eq!((tomb.version, tomb.content), (2, None));

        let paths: Vec<_> = svc
            .list_current("P1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(paths, vec!["b.ts"]);

        assert!(svc.get("P1", "a.ts", false).await.unwrap().is_none());
        let audit = svc.get("P1", "a.ts", true).await.unwrap().unwrap();
        assert!(audit.is_tombstone());
    }

    #[tokio::test]
    async fn test_bulk_duplicate_paths_end_at_last_entry() {
        let svc = service();
        let result = svc
            .bulk_upsert(
                "P1",
                vec![
                    BulkEntry::update("a.ts", "1"),
                    BulkEntry::update("b.ts", "b"),
                    BulkEntry::update("a.ts", "2"),
                    BulkEntry::update("a.ts", "3").expecting(2),
                ],
            )
            .await
            .unwrap();
        assert!(result.applied);
        assert_eq!((result.processed, result.upserted), (4, 4));
        assert_eq!(result.results[3].outcome, BulkOutcome::Applied { version: 3 });

        let a = svc.get("P1", "a.ts", false).await.unwrap().unwrap();
        assert_eq!((a.version, a.content.as_deref()), (3, Some("3")));
    }

    #[tokio::test]
    async fn test_bulk_rejected_as_a_whole() {
        let svc = service();
        svc.upsert("P1", "a.ts", "a", FileKind::File, None).await.unwrap();
        let result = svc
            .bulk_upsert(
                "P1",
                vec![
                    BulkEntry::update("new.ts", "n"),
                    BulkEntry::update("a.ts", "stale").expecting(5),
                    BulkEntry::delete("missing.ts"),
                ],
            )
            .await
            .unwrap();
        assert!(!result.applied);
        assert_eq!(result.upserted, 0);
        assert_eq!(result.results[0].outcome, BulkOutcome::Skipped);
        assert_eq!(
            result.results[1].outcome,
            BulkOutcome::Conflict { current_version: Some(1) }
        );
        assert_eq!(result.results[2].outcome, BulkOutcome::NotFound);
        assert!(svc.get("P1", "new.ts", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_paths_rejected() {
        let svc = service();
        let err = svc
            .upsert("P1", "../etc/passwd", "x", FileKind::File, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_snapshot_export_import() {
        let svc = service();
        svc.upsert("P1", "src/a.ts", "a", FileKind::File, None).await.unwrap();
        svc.upsert("P1", "gone.ts", "g", FileKind::File, None).await.unwrap();
        svc.delete("P1", "gone.ts", None).await.unwrap();

        let archive = svc.export_snapshot("P1").await.unwrap();
        let result = svc.import_snapshot("P2", archive).await.unwrap();
        assert!(result.applied);
        assert_eq!(result.upserted, 1);
        let records = svc.list_current("P2").await.unwrap();
        assert_eq!(records[0].path, "src/a.ts");
    }

    #[tokio::test]
    async fn test_writes_publish_events() {
        let bus = bus();
        let svc = service().with_bus(bus.clone());
        let viewer = Subject::user("u1").with_role("P1", Role::Viewer);
        let mut sub = bus.subscribe("project:P1:files", &viewer).unwrap();

        svc.upsert("P1", "a.ts", "v1", FileKind::File, None).await.unwrap();
        let msg = sub.recv().await.unwrap();
        let EventPayload::FileUpdate(update) = &msg.body else {
            panic!("expected file:update");
        };
        assert_eq!((update.file_path.as_str(), update.version), ("a.ts", Some(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_event_is_replayed_with_latest_state() {
        let bus = bus();
        let svc = service().with_bus(bus.clone());
        let viewer = Subject::user("u1").with_role("P1", Role::Viewer);
        let mut sub = bus.subscribe("project:P1:files", &viewer).unwrap();

        svc.upsert("P1", "a.ts", "v1", FileKind::File, None).await.unwrap();
        svc.upsert("P1", "a.ts", "v2", FileKind::File, Some(1)).await.unwrap();
        svc.upsert("P1", "a.ts", "v3", FileKind::File, Some(2)).await.unwrap();

        let first = sub.recv().await.unwrap();
        let trailing = sub.recv().await.unwrap();
        let (EventPayload::FileUpdate(a), EventPayload::FileUpdate(b)) = (&first.body, &trailing.body)
        else {
            panic!("expected file updates");
        };
        assert_eq!(a.content, "v1");
        assert_eq!(b.content, "v3");
    }
}
