//! Pre-flight session quota.

use crate::error::{CoreError, Result};
use crate::store::SessionStore;
use async_trait::async_trait;
use harbor_machine::ResourceTier;
use std::sync::Arc;

/// External quota collaborator consulted before a session is created.
#[async_trait]
pub trait QuotaService: Send + Sync {
    /// Return `Ok(())` if `user_id` may open another session on `tier`.
    ///
    /// Any error rejects the request; callers surface it as
    /// [`CoreError::QuotaExceeded`].
    async fn check(&self, user_id: &str, tier: ResourceTier) -> Result<()>;
}

/// Limits a user's non-terminal sessions to the tier's
/// `max_concurrent_sessions`.
pub struct ActiveSessionQuota {
    store: Arc<dyn SessionStore>,
}

impl ActiveSessionQuota {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QuotaService for ActiveSessionQuota {
    async fn check(&self, user_id: &str, tier: ResourceTier) -> Result<()> {
        let limit = tier.limits().max_concurrent_sessions;
        let open = self
            .store
            .list_for_user(user_id)
            .await?
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count();

        if open >= limit {
            return Err(CoreError::QuotaExceeded(format!(
                "user {user_id} has {open} open sessions (limit {limit} on tier {})",
                tier.as_str()
            )));
        }
        Ok(())
    }
}

/// Quota that admits everything.
pub struct Unlimited;

#[async_trait]
impl QuotaService for Unlimited {
    async fn check(&self, _user_id: &str, _tier: ResourceTier) -> Result<()> {
        Ok(())
    }
}
