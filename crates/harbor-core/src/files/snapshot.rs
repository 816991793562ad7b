//! Snapshot archives (`tar.gz`) of a project's current files.
//!
//! Every archive carries a JSON marker at [`SNAPSHOT_MARKER`]; an archive
//! without it is rejected as incomplete.

use super::record::{normalize_path, resolve_in, FileRecord};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;

/// Marker file name at the archive root.
pub const SNAPSHOT_MARKER: &str = ".harbor-snapshot";

const FORMAT_VERSION: u32 = 1;

/// Contents of the marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub format: u32,
}

/// A decoded archive.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub manifest: SnapshotManifest,
    /// `(normalized path, bytes)` in archive order.
    pub files: Vec<(String, Vec<u8>)>,
}

fn snapshot_err(context: &str) -> impl Fn(std::io::Error) -> CoreError + '_ {
    move |e| CoreError::Snapshot(format!("{context}: {e}"))
}

/// Build a gzip-compressed tar of the live records in `records`.
pub fn build_archive(project_id: &str, records: &[FileRecord]) -> Result<Vec<u8>> {
    let live: Vec<&FileRecord> = records.iter().filter(|r| !r.is_tombstone()).collect();
    let manifest = SnapshotManifest {
        project_id: project_id.to_string(),
        created_at: Utc::now(),
        file_count: live.len(),
        format: FORMAT_VERSION,
    };
    let mtime = manifest.created_at.timestamp().max(0) as u64;

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut append = |path: &str, data: &[u8]| -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        builder
            .append_data(&mut header, path, data)
            .map_err(snapshot_err("append entry"))
    };

    append(SNAPSHOT_MARKER, &serde_json::to_vec(&manifest)?)?;
    for record in &live {
        if let Some(content) = &record.content {
            append(&record.path, &record.kind.decode(content)?)?;
        }
    }

    builder
        .into_inner()
        .map_err(snapshot_err("finish archive"))?
        .finish()
        .map_err(snapshot_err("finish gzip stream"))
}

/// Decode an archive, verifying the marker.
pub fn read_archive(bytes: &[u8]) -> Result<Snapshot> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut manifest = None;
    let mut files = Vec::new();

    for entry in archive.entries().map_err(snapshot_err("read archive"))? {
        let mut entry = entry.map_err(snapshot_err("read entry"))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_path = entry
            .path()
            .map_err(snapshot_err("entry path"))?
            .to_string_lossy()
            .into_owned();
        let path = normalize_path(&raw_path)?;

        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(snapshot_err("entry content"))?;

        if path == SNAPSHOT_MARKER {
            manifest = Some(serde_json::from_slice::<SnapshotManifest>(&data)?);
        } else {
            files.push((path, data));
        }
    }

    let manifest = manifest
        .ok_or_else(|| CoreError::Snapshot(format!("archive has no {SNAPSHOT_MARKER} marker")))?;
    Ok(Snapshot { manifest, files })
}

/// Extract an archive into `dest`. Returns the number of files written.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<usize> {
    let snapshot = read_archive(bytes)?;
    for (path, data) in &snapshot.files {
        let target = resolve_in(dest, path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, data)?;
    }
    tracing::debug!(
        project_id = %snapshot.manifest.project_id,
        files = snapshot.files.len(),
        dest = %dest.display(),
        "Snapshot extracted"
    );
    Ok(snapshot.files.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::record::{content_hash, FileKind};

    fn record(path: &str, content: Option<&str>) -> FileRecord {
        FileRecord {
            project_id: "P1".into(),
            path: path.into(),
            content: content.map(String::from),
            kind: FileKind::File,
            content_hash: content.map(content_hash),
            version: 1,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_archive_excludes_tombstones() {
        let bytes = build_archive(
            "P1",
            &[
                record("src/a.ts", Some("a")),
                record("gone.ts", None),
                record("index.html", Some("<html/>")),
            ],
        )
        .unwrap();

        let snapshot = read_archive(&bytes).unwrap();
        assert_eq!(snapshot.manifest.project_id, "P1");
        assert_eq!(snapshot.manifest.file_count, 2);
        let paths: Vec<_> = snapshot.files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["src/a.ts", "index.html"]);
    }

    #[test]
    fn test_archive_without_marker_rejected() {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_mode(0o644);
        builder.append_data(&mut header, "a.ts", &b"x"[..]).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(read_archive(&bytes), Err(CoreError::Snapshot(_))));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(read_archive(b"not a tarball").is_err());
    }

    #[test]
    fn test_extract_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = build_archive("P1", &[record("src/deep/a.ts", Some("hello"))]).unwrap();

        assert_eq!(extract_archive(&bytes, dir.path()).unwrap(), 1);
        let written = std::fs::read_to_string(dir.path().join("src/deep/a.ts")).unwrap();
        assert_eq!(written, "hello");
        assert!(!dir.path().join(SNAPSHOT_MARKER).exists());
    }
}
