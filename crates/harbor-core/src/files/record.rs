//! Versioned file records and path handling.

use crate::error::{CoreError, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How `content` is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    /// UTF-8 text stored as-is.
    #[default]
    File,
    /// Arbitrary bytes stored as standard base64.
    BinaryBase64,
}

impl FileKind {
    /// Decode stored content to the bytes written on disk.
    pub fn decode(&self, content: &str) -> Result<Vec<u8>> {
        match self {
            FileKind::File => Ok(content.as_bytes().to_vec()),
            FileKind::BinaryBase64 => general_purpose::STANDARD
                .decode(content)
                .map_err(|e| CoreError::Validation(format!("invalid base64 content: {e}"))),
        }
    }

    /// Encode on-disk bytes for storage, choosing text when possible.
    pub fn encode(bytes: &[u8]) -> (FileKind, String) {
        match std::str::from_utf8(bytes) {
            Ok(text) => (FileKind::File, text.to_string()),
            Err(_) => (
                FileKind::BinaryBase64,
                general_purpose::STANDARD.encode(bytes),
            ),
        }
    }
}

/// One versioned file inside a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub project_id: String,
    pub path: String,
    /// `None` marks a tombstone.
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub content_hash: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn is_tombstone(&self) -> bool {
        self.content.is_none()
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            path: self.path.clone(),
            version: self.version,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Result shape of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub path: String,
    pub version: u64,
    pub content_hash: Option<String>,
}

/// Hex-encoded blake3 hash of stored content.
pub fn content_hash(content: &str) -> String {
    hex::encode(blake3::hash(content.as_bytes()).as_bytes())
}

/// Canonical project-relative form of `path`.
///
/// Backslashes become `/`, leading `./` and `/` are stripped and `.`
/// segments dropped. Empty paths, `..` segments and NUL bytes are rejected.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(CoreError::InvalidPath("path contains NUL".into()));
    }
    let unified = path.replace('\\', "/");
    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(CoreError::InvalidPath(format!(
                    "{path}: parent segments are not allowed"
                )))
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(CoreError::InvalidPath(format!("{path:?} is empty")));
    }
    Ok(segments.join("/"))
}

/// Join a project-relative path under `root`, refusing escapes.
pub fn resolve_in(root: &Path, path: &str) -> Result<PathBuf> {
    let normalized = normalize_path(path)?;
    Ok(root.join(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("./src/a.ts").unwrap(), "src/a.ts");
        assert_eq!(normalize_path("/src//b.ts").unwrap(), "src/b.ts");
        assert_eq!(normalize_path("src\\c\\d.ts").unwrap(), "src/c/d.ts");
        assert_eq!(normalize_path("src/./e.ts").unwrap(), "src/e.ts");
    }

    #[test]
    fn test_normalize_rejects_escapes() {
        for bad in ["", "/", "./", "../etc/passwd", "src/../../x", "a\0b"] {
            assert!(
                matches!(normalize_path(bad), Err(CoreError::InvalidPath(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_in_stays_under_root() {
        let root = Path::new("/workspace");
        assert_eq!(
            resolve_in(root, "/src/a.ts").unwrap(),
            PathBuf::from("/workspace/src/a.ts")
        );
        assert!(resolve_in(root, "../a.ts").is_err());
    }

    #[test]
    fn test_binary_round_trip() {
        let bytes = [0xff, 0x00, 0x89, 0x50];
        let (kind, stored) = FileKind::encode(&bytes);
        assert_eq!(kind, FileKind::BinaryBase64);
        assert_eq!(kind.decode(&stored).unwrap(), bytes);

        let (kind, stored) = FileKind::encode(b"hello");
        assert_eq!((kind, stored.as_str()), (FileKind::File, "hello"));
    }

    #[test]
    fn test_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&FileKind::BinaryBase64).unwrap(),
            "\"binary-base64\""
        );
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let h = content_hash("v1");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("v1"));
        assert_ne!(h, content_hash("v2"));
    }
}
