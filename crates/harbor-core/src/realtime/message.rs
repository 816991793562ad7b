//! Broadcast envelope and event payloads.
//!
//! # Delivery contract
//!
//! Delivery is at-least-once, ordered per sender and unordered across
//! senders. Every message carries a unique `id` that receivers may use to
//! drop duplicates, and every payload type is safe to apply more than once:
//!
//! | Event | Idempotency |
//! |---|---|
//! | `file:update` | Overwrites the whole file; replays converge. Carries `version` when known so stale updates can be skipped. |
//! | `file:delete` | Removing a missing file is a no-op. |
//! | `file:bulk-update` | Each entry is a `file:update` or `file:delete` with the same contract. |
//! | `hot_reload` | Triggers a rebuild; extra rebuilds are harmless. |
//! | `session:status` | Carries the absolute status, never a delta. |

use crate::files::FileKind;
use crate::session::{SessionId, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery priority hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// A message delivered on a named channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Unique message id; the deduplication key.
    pub id: Uuid,
    pub channel: String,
    pub sender_id: String,
    #[serde(default)]
    pub priority: Priority,
    pub sent_at: DateTime<Utc>,
    /// Messages are not delivered after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub body: EventPayload,
}

impl BroadcastMessage {
    pub fn new(channel: impl Into<String>, sender_id: impl Into<String>, body: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            sender_id: sender_id.into(),
            priority: Priority::Normal,
            sent_at: Utc::now(),
            expires_at: None,
            body,
        }
    }

    /// Event type string as it appears on the wire.
    pub fn event_type(&self) -> &'static str {
        self.body.event_type()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Event payloads, tagged on the wire as `{"event": ..., "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "file:update")]
    FileUpdate(FileUpdate),
    #[serde(rename = "file:delete")]
    FileDelete(FileDelete),
    #[serde(rename = "file:bulk-update")]
    FileBulkUpdate(FileBulkUpdate),
    #[serde(rename = "hot_reload")]
    HotReload(HotReload),
    #[serde(rename = "session:status")]
    SessionStatus(SessionStatusEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::FileUpdate(_) => "file:update",
            Self::FileDelete(_) => "file:delete",
            Self::FileBulkUpdate(_) => "file:bulk-update",
            Self::HotReload(_) => "hot_reload",
            Self::SessionStatus(_) => "session:status",
        }
    }

    /// Default rate-limit key within a channel.
    pub fn default_key(&self) -> Option<&str> {
        match self {
            Self::FileUpdate(u) => Some(&u.file_path),
            Self::FileDelete(d) => Some(&d.file_path),
            Self::SessionStatus(s) => Some(s.status.as_str()),
            Self::FileBulkUpdate(_) | Self::HotReload(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpdate {
    pub file_path: String,
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDelete {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Change kind inside a bulk update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFileChange {
    pub file_path: String,
    pub action: ChangeAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: FileKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBulkUpdate {
    pub files: Vec<BulkFileChange>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotReload {
    pub project_id: String,
    pub changed_files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub session_id: SessionId,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}
