//! Preview session types and the lifecycle state machine.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use harbor_machine::ResourceTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the compute instance backing this session.
    pub fn machine_name(&self) -> String {
        format!("preview-{}", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle status of a preview session.
///
/// ```text
/// pending ──▶ active ──▶ terminating ──▶ terminated
///    │          │             │
///    └──────────┴──▶ error ◀──┘
///                     │
///                     └──▶ terminating
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Error,
    Terminating,
    Terminated,
}

impl SessionStatus {
    /// Whether `next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Error)
                | (Active, Terminating)
                | (Active, Error)
                | (Terminating, Terminated)
                | (Terminating, Error)
                | (Error, Terminating)
        )
    }

    /// Whether the session has reached its final state.
    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Terminated
    }

    /// Whether a container id may be recorded in this status.
    pub fn holds_container(self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::Terminating)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ephemeral compute allocation for a project preview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewSession {
    pub id: SessionId,
    pub project_id: String,
    pub user_id: String,
    pub device_type: String,
    pub container_id: Option<String>,
    pub container_url: Option<String>,
    pub status: SessionStatus,
    pub resource_tier: ResourceTier,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PreviewSession {
    /// A fresh `pending` session expiring after the tier's maximum duration.
    pub fn pending(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        device_type: impl Into<String>,
        tier: ResourceTier,
    ) -> Self {
        let now = Utc::now();
        let hours = i64::from(tier.limits().max_duration_hours);
        Self {
            id: SessionId::new(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            device_type: device_type.into(),
            container_id: None,
            container_url: None,
            status: SessionStatus::Pending,
            resource_tier: tier,
            error_message: None,
            created_at: now,
            expires_at: now + ChronoDuration::hours(hours),
            ended_at: None,
            updated_at: now,
        }
    }

    /// Whether the session should be swept at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now && !self.status.is_terminal()
    }

    /// Map to the shape returned by the session API.
    pub fn to_public(&self) -> PublicSession {
        PublicSession {
            session_id: self.id.clone(),
            project_id: self.project_id.clone(),
            user_id: self.user_id.clone(),
            container_id: self.container_id.clone(),
            container_url: self.container_url.clone(),
            status: self.status,
            resource_tier: self.resource_tier,
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            ended_at: self.ended_at,
        }
    }
}

/// Session snapshot returned to API consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicSession {
    pub session_id: SessionId,
    pub project_id: String,
    /// User who created the session.
    pub user_id: String,
    pub container_id: Option<String>,
    pub container_url: Option<String>,
    pub status: SessionStatus,
    pub resource_tier: ResourceTier,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Parameters of a session creation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub project_id: String,
    pub user_id: String,
    #[serde(default = "default_device_type")]
    pub device_type: String,
    #[serde(default)]
    pub tier: Option<String>,
}

fn default_device_type() -> String {
    "desktop".to_string()
}

/// Field changes applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// Instance id and URL to record (only kept in `active`/`terminating`).
    pub container: Option<(String, String)>,
    /// Error message to record.
    pub error_message: Option<String>,
}

impl SessionUpdate {
    /// Bind a provisioned instance.
    pub fn container(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            container: Some((id.into(), url.into())),
            error_message: None,
        }
    }

    /// Record a failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            container: None,
            error_message: Some(message.into()),
        }
    }

    /// Apply to a session already moved to `to`.
    pub(crate) fn apply(self, session: &mut PreviewSession, to: SessionStatus) {
        let now = Utc::now();
        session.status = to;
        session.updated_at = now;

        if let Some((id, url)) = self.container {
            session.container_id = Some(id);
            session.container_url = Some(url);
        }
        if !to.holds_container() {
            session.container_id = None;
        }
        if let Some(message) = self.error_message {
            session.error_message = Some(message);
        }
        if to == SessionStatus::Terminated {
            session.ended_at = Some(now);
        }
    }
}
