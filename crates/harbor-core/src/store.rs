//! Session persistence seam.

use crate::error::{CoreError, Result};
use crate::session::{PreviewSession, SessionId, SessionStatus, SessionUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Durable storage for preview sessions.
///
/// Rows are never deleted. The only mutation after insert is
/// [`transition`](SessionStore::transition), a compare-and-set on status, so
/// two callers racing on the same session commute: one wins, the other
/// observes `InvalidTransition` with the winner's status.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new row. Fails if the id already exists.
    async fn insert(&self, session: PreviewSession) -> Result<()>;

    /// Load a row.
    async fn get(&self, id: &SessionId) -> Result<Option<PreviewSession>>;

    /// Move `id` to `to` if its current status is one of `allowed_from`
    /// and the edge is on the lifecycle graph.
    async fn transition(
        &self,
        id: &SessionId,
        allowed_from: &[SessionStatus],
        to: SessionStatus,
        update: SessionUpdate,
    ) -> Result<PreviewSession>;

    /// Non-terminal sessions whose `expires_at` is before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<PreviewSession>>;

    /// All sessions owned by a user, newest first.
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PreviewSession>>;
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, PreviewSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Overwrite a row's expiry (used by sweeps in tests and admin tooling).
    pub async fn set_expires_at(&self, id: &SessionId, at: DateTime<Utc>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;
        session.expires_at = at;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: PreviewSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(CoreError::Store(format!(
                "session {} already exists",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, id: &SessionId) -> Result<Option<PreviewSession>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &SessionId,
        allowed_from: &[SessionStatus],
        to: SessionStatus,
        update: SessionUpdate,
    ) -> Result<PreviewSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| CoreError::SessionNotFound(id.clone()))?;

        let from = session.status;
        if !allowed_from.contains(&from) || !from.can_transition_to(to) {
            return Err(CoreError::InvalidTransition { from, to });
        }

        update.apply(session, to);
        tracing::debug!(session_id = %id, %from, %to, "Session transitioned");
        Ok(session.clone())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<PreviewSession>> {
        let sessions = self.sessions.read().await;
        let mut expired: Vec<_> = sessions
            .values()
            .filter(|s| s.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|s| s.expires_at);
        Ok(expired)
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<PreviewSession>> {
        let sessions = self.sessions.read().await;
        let mut owned: Vec<_> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }
}
