//! Versioned project files: optimistic-concurrency storage, change
//! notifications, snapshot archives and sandbox hydration.

mod hydrate;
mod record;
mod service;
mod snapshot;
mod store;

pub use hydrate::{
    storage_prefix, write_records, HydrationConfig, HydrationReport, HydrationStrategy, Hydrator,
    MemoryObjectStorage, ObjectStorage, RecordsStrategy, ScaffoldStrategy, SnapshotStrategy,
    StageAttempt, StageOutcome, StorageStrategy,
};
pub use record::{content_hash, normalize_path, resolve_in, FileKind, FileRecord, FileSummary};
pub use service::{
    BulkAction, BulkEntry, BulkEntryResult, BulkOutcome, BulkResult, FileSyncService, RecordSource,
};
pub use snapshot::{
    build_archive, extract_archive, read_archive, Snapshot, SnapshotManifest, SNAPSHOT_MARKER,
};
pub use store::{BatchOutcome, FileStore, FileWrite, MemoryFileStore, Precondition, WriteOutcome};
