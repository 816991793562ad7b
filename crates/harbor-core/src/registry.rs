//! Session registry: creates, tears down and sweeps preview sessions.

use crate::config::{boot_env, RegistryConfig};
use crate::error::{CoreError, Result};
use crate::quota::QuotaService;
use crate::realtime::{session_channel, ChannelBus, EventPayload, PublishOptions, SessionStatusEvent, Subject};
use crate::session::{
    CreateSessionRequest, PreviewSession, PublicSession, SessionId, SessionStatus, SessionUpdate,
};
use crate::store::SessionStore;
use chrono::Utc;
use dashmap::DashMap;
use harbor_machine::{apply_to_request, MachineError, ProvisioningRequest, Provisioner, ResourceTier};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one session in a cleanup sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupOutcome {
    pub session_id: SessionId,
    /// Final status on success.
    pub status: Option<SessionStatus>,
    /// Failure message; the session is left for the next sweep.
    pub error: Option<String>,
}

/// Result of [`SessionRegistry::cleanup_expired_sessions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub examined: usize,
    pub terminated: usize,
    pub failed: usize,
    pub outcomes: Vec<CleanupOutcome>,
}

/// Owns the session lifecycle.
///
/// Every status change goes through [`SessionStore::transition`], so a
/// destroy racing an expiry sweep or a second destroy is harmless: the
/// loser observes the winner's status and returns without acting.
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    provisioner: Provisioner,
    quota: Arc<dyn QuotaService>,
    bus: Option<ChannelBus>,
    subject: Subject,
    config: RegistryConfig,
    /// Per-user gates serialising quota check and insert.
    admissions: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl SessionRegistry {
    /// Create a new registry.
    pub fn new(
        store: Arc<dyn SessionStore>,
        provisioner: Provisioner,
        quota: Arc<dyn QuotaService>,
        config: RegistryConfig,
    ) -> Self {
        tracing::info!(image = %config.image, preview_domain = %config.preview_domain, "Creating session registry");
        Self {
            store,
            provisioner,
            quota,
            bus: None,
            subject: Subject::system("harbor-registry"),
            config,
            admissions: DashMap::new(),
        }
    }

    /// Publish status changes on `session:{id}`.
    pub fn with_bus(mut self, bus: ChannelBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create a session and provision its instance.
    ///
    /// The quota is checked before anything is persisted. A provisioning
    /// failure leaves the session in `error` and is returned as
    /// [`CoreError::Provisioning`]; the whole creation is not retried.
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<PublicSession> {
        if request.project_id.trim().is_empty() {
            return Err(CoreError::Validation("projectId is required".into()));
        }
        if request.user_id.trim().is_empty() {
            return Err(CoreError::Validation("userId is required".into()));
        }
        let tier = request
            .tier
            .as_deref()
            .map_or(ResourceTier::DEFAULT, ResourceTier::resolve);

        let session = PreviewSession::pending(
            request.project_id,
            request.user_id,
            request.device_type,
            tier,
        );
        let id = session.id.clone();
        let machine_request = apply_to_request(&self.provisioning_request(&session), tier);
        self.admit(session).await?;
        tracing::info!(
            session_id = %id,
            tier = %tier,
            ports = ?machine_request.ports,
            "Session pending"
        );

        let info = match self.provisioner.create(&machine_request).await {
            Ok(info) => info,
            Err(source) => {
                tracing::error!(session_id = %id, error = %source, "Provisioning failed");
                let failed = self
                    .store
                    .transition(
                        &id,
                        &[SessionStatus::Pending],
                        SessionStatus::Error,
                        SessionUpdate::error(source.to_string()),
                    )
                    .await;
                if let Ok(session) = &failed {
                    self.announce(session);
                }
                return Err(CoreError::Provisioning {
                    session_id: id,
                    source,
                });
            }
        };

        let port = machine_request
            .ports
            .first()
            .copied()
            .unwrap_or_else(|| tier.preview_port());
        let url = self.container_url(&id, port);
        match self
            .store
            .transition(
                &id,
                &[SessionStatus::Pending],
                SessionStatus::Active,
                SessionUpdate::container(info.id.clone(), url),
            )
            .await
        {
            Ok(session) => {
                tracing::info!(session_id = %id, instance_id = %info.id, "Session active");
                self.announce(&session);
                Ok(session.to_public())
            }
            Err(e) => {
                // Destroyed while provisioning; the instance has no owner.
                tracing::warn!(session_id = %id, instance_id = %info.id, error = %e, "Session left pending before activation, removing instance");
                if let Err(teardown) = self.teardown(&info.id).await {
                    tracing::error!(session_id = %id, instance_id = %info.id, error = %teardown, "Failed to remove orphaned instance");
                }
                Err(e)
            }
        }
    }

    /// Tear down a session's instance and mark it `terminated`.
    ///
    /// Already-terminated sessions and instances that are already gone
    /// are not errors.
    pub async fn destroy_session(&self, id: &SessionId) -> Result<PublicSession> {
        let mut session = self.load(id).await?;

        if session.status == SessionStatus::Terminated {
            return Ok(session.to_public());
        }

        if session.status == SessionStatus::Pending {
            match self
                .store
                .transition(
                    id,
                    &[SessionStatus::Pending],
                    SessionStatus::Error,
                    SessionUpdate::error("destroyed before provisioning completed"),
                )
                .await
            {
                Ok(_) | Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        session = match self
            .store
            .transition(
                id,
                &[SessionStatus::Active, SessionStatus::Error],
                SessionStatus::Terminating,
                SessionUpdate::default(),
            )
            .await
        {
            Ok(session) => session,
            Err(CoreError::InvalidTransition { from, .. }) => {
                tracing::debug!(session_id = %id, status = %from, "Teardown already handled elsewhere");
                return Ok(self.load(id).await?.to_public());
            }
            Err(e) => return Err(e),
        };
        self.announce(&session);
        tracing::info!(session_id = %id, "Session terminating");

        let teardown = match self.resolve_instance(&session).await {
            Ok(Some(instance_id)) => self.teardown(&instance_id).await,
            Ok(None) => {
                tracing::debug!(session_id = %id, "No instance to tear down");
                Ok(())
            }
            Err(e) => Err(e),
        };

        match teardown {
            Ok(()) => {
                let session = self
                    .store
                    .transition(
                        id,
                        &[SessionStatus::Terminating],
                        SessionStatus::Terminated,
                        SessionUpdate::default(),
                    )
                    .await?;
                tracing::info!(session_id = %id, "Session terminated");
                self.announce(&session);
                Ok(session.to_public())
            }
            Err(e) => {
                tracing::error!(session_id = %id, error = %e, "Teardown failed");
                if let Ok(session) = self
                    .store
                    .transition(
                        id,
                        &[SessionStatus::Terminating],
                        SessionStatus::Error,
                        SessionUpdate::error(format!("teardown failed: {e}")),
                    )
                    .await
                {
                    self.announce(&session);
                }
                Err(CoreError::Machine(e))
            }
        }
    }

    /// Current public view of a session, `None` if unknown.
    pub async fn get_session_status(&self, id: &SessionId) -> Result<Option<PublicSession>> {
        Ok(self.store.get(id).await?.map(|s| s.to_public()))
    }

    /// A user's sessions, newest first.
    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<PublicSession>> {
        Ok(self
            .store
            .list_for_user(user_id)
            .await?
            .iter()
            .map(PreviewSession::to_public)
            .collect())
    }

    /// Move a live session to `error`, e.g. when its agent reports a fatal
    /// boot failure.
    pub async fn report_failure(&self, id: &SessionId, message: impl Into<String>) -> Result<PublicSession> {
        let session = self
            .store
            .transition(
                id,
                &[SessionStatus::Pending, SessionStatus::Active],
                SessionStatus::Error,
                SessionUpdate::error(message),
            )
            .await?;
        tracing::warn!(session_id = %id, error = ?session.error_message, "Session failed");
        self.announce(&session);
        Ok(session.to_public())
    }

    /// Destroy every expired session, continuing past failures.
    pub async fn cleanup_expired_sessions(&self) -> Result<CleanupReport> {
        let expired = self.store.list_expired(Utc::now()).await?;
        let mut report = CleanupReport {
            examined: expired.len(),
            ..CleanupReport::default()
        };

        for session in expired {
            let outcome = match self.destroy_session(&session.id).await {
                Ok(public) => {
                    if public.status == SessionStatus::Terminated {
                        report.terminated += 1;
                    }
                    CleanupOutcome {
                        session_id: session.id,
                        status: Some(public.status),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %session.id, error = %e, "Failed to clean up expired session");
                    report.failed += 1;
                    CleanupOutcome {
                        session_id: session.id,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                terminated = report.terminated,
                failed = report.failed,
                "Expired session sweep finished"
            );
        }
        Ok(report)
    }

    /// Run [`cleanup_expired_sessions`](Self::cleanup_expired_sessions)
    /// every `interval` until the returned handle is aborted.
    pub fn spawn_cleanup_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.cleanup_expired_sessions().await {
                    tracing::error!(error = %e, "Expired session sweep failed");
                }
            }
        })
    }

    /// Check the quota and persist the `pending` row while holding the
    /// user's gate, so two concurrent creates never both pass a check that
    /// should have counted the other.
    async fn admit(&self, session: PreviewSession) -> Result<()> {
        let user_id = session.user_id.clone();
        let gate = self.admissions.entry(user_id.clone()).or_default().clone();
        let outcome = {
            let _admitting = gate.lock().await;
            self.check_and_insert(session).await
        };
        drop(gate);
        self.admissions
            .remove_if(&user_id, |_, gate| Arc::strong_count(gate) == 1);
        outcome
    }

    async fn check_and_insert(&self, session: PreviewSession) -> Result<()> {
        self.quota
            .check(&session.user_id, session.resource_tier)
            .await
            .map_err(|e| match e {
                CoreError::QuotaExceeded(_) => e,
                other => CoreError::QuotaExceeded(format!("quota check unavailable: {other}")),
            })?;
        self.store.insert(session).await
    }

    async fn load(&self, id: &SessionId) -> Result<PreviewSession> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::SessionNotFound(id.clone()))
    }

    /// Recorded instance id if the compute API still knows it, otherwise a
    /// lookup by machine name.
    async fn resolve_instance(&self, session: &PreviewSession) -> std::result::Result<Option<String>, MachineError> {
        if let Some(instance_id) = &session.container_id {
            match self.provisioner.get_state(instance_id).await {
                Ok(state) => {
                    tracing::debug!(session_id = %session.id, instance_id = %instance_id, state = %state, "Resolved instance");
                    return Ok(Some(instance_id.clone()));
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!(session_id = %session.id, instance_id = %instance_id, "Recorded instance id is stale, looking up by name");
                }
                Err(e) => return Err(e),
            }
        }
        self.provisioner
            .find_by_name(&session.id.machine_name())
            .await
    }

    async fn teardown(&self, instance_id: &str) -> std::result::Result<(), MachineError> {
        self.provisioner.stop(instance_id).await?;
        self.provisioner.delete(instance_id).await
    }

    fn provisioning_request(&self, session: &PreviewSession) -> ProvisioningRequest {
        let tier = session.resource_tier;
        let mut request = ProvisioningRequest::new(
            session.id.machine_name(),
            &self.config.image,
            tier.limits().resources,
        )
        .env(boot_env::SESSION_ID, session.id.as_str())
        .env(boot_env::PROJECT_ID, &session.project_id)
        .env(boot_env::PREVIEW_DOMAIN, &self.config.preview_domain)
        .env(boot_env::PREVIEW_PORT, tier.preview_port().to_string());

        for port in &self.config.ports {
            request = request.port(*port);
        }
        if let Some(region) = &self.config.region {
            request = request.region(region);
        }
        if let Some(url) = self.config.snapshot_url(&session.project_id) {
            request = request.env(boot_env::SNAPSHOT_URL, url);
        }
        if let Some(url) = &self.config.realtime_url {
            request = request.env(boot_env::REALTIME_URL, url);
        }
        for (key, value) in &self.config.agent_env {
            request = request.env(key, value);
        }
        request
            .metadata
            .insert("session_id".into(), session.id.to_string());
        request
            .metadata
            .insert("project_id".into(), session.project_id.clone());
        request
    }

    fn container_url(&self, id: &SessionId, port: u16) -> String {
        format!("https://{id}-{port}.{}", self.config.preview_domain)
    }

    fn announce(&self, session: &PreviewSession) {
        let Some(bus) = &self.bus else { return };
        let event = EventPayload::SessionStatus(SessionStatusEvent {
            session_id: session.id.clone(),
            status: session.status,
            container_url: session.container_url.clone(),
            error_message: session.error_message.clone(),
            timestamp: session.updated_at,
        });
        if let Err(e) = bus.publish(
            &session_channel(session.id.as_str()),
            &self.subject,
            event,
            PublishOptions::default(),
        ) {
            tracing::warn!(session_id = %session.id, status = %session.status, error = %e, "Failed to publish session status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{ActiveSessionQuota, Unlimited};
    use crate::realtime::{AccessPolicySet, BusConfig, RateLimitConfig, RateLimiter};
    use crate::store::MemorySessionStore;
    use harbor_machine::{FakeMachineApi, RetryPolicy};

    struct Harness {
        api: Arc<FakeMachineApi>,
        store: Arc<MemorySessionStore>,
        registry: SessionRegistry,
    }

    fn harness() -> Harness {
        let api = Arc::new(FakeMachineApi::new());
        let store = Arc::new(MemorySessionStore::new());
        let provisioner = Provisioner::new(api.clone()).with_retry(
            RetryPolicy::with_attempts(2)
                .delays(Duration::from_millis(1), Duration::from_millis(1))
                .without_jitter(),
        );
        let registry = SessionRegistry::new(
            store.clone(),
            provisioner,
            Arc::new(Unlimited),
            RegistryConfig::builder()
                .preview_domain("preview.example.com")
                .snapshot_url_base("https://snapshots.example.com")
                .build()
                .unwrap(),
        );
        Harness {
            api,
            store,
            registry,
        }
    }

    fn request(tier: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            project_id: "P1".into(),
            user_id: "U1".into(),
            device_type: "desktop".into(),
            tier: Some(tier.into()),
        }
    }

    #[tokio::test]
    async fn test_create_session_activates() {
        let h = harness();
        let session = h.registry.create_session(request("free")).await.unwrap();

        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.container_id.as_deref(), Some("m-1"));
        assert_eq!(
            session.container_url.as_deref(),
            Some(format!("https://{}-3000.preview.example.com", session.session_id).as_str())
        );

        let machine = h.api.machine("m-1").unwrap();
        assert_eq!(machine.name, session.session_id.machine_name());
    }

    #[tokio::test]
    async fn test_provisioning_request_shape() {
        let h = harness();
        let session = PreviewSession::pending("P1", "U1", "desktop", ResourceTier::Free);
        let request = apply_to_request(&h.registry.provisioning_request(&session), ResourceTier::Free);

        assert_eq!(request.ports, vec![3000]);
        assert_eq!(request.resources, ResourceTier::Free.limits().resources);
        assert_eq!(
            request.env.get(boot_env::SNAPSHOT_URL).map(String::as_str),
            Some("https://snapshots.example.com/P1.tar.gz")
        );
        assert_eq!(
            request.env.get(boot_env::SESSION_ID).map(String::as_str),
            Some(session.id.as_str())
        );
    }

    #[tokio::test]
    async fn test_provisioning_failure_leaves_error() {
        let h = harness();
        h.api
            .fail_next("create", MachineError::from_status(422, "bad image"));

        let err = h.registry.create_session(request("pro")).await.unwrap_err();
        let CoreError::Provisioning { session_id, .. } = err else {
            panic!("expected provisioning error, got {err}");
        };
        assert_eq!(h.api.call_count("create"), 1);

        let session = h.registry.get_session_status(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert!(session.container_id.is_none());
        assert!(session.error_message.is_some());
    }

    #[tokio::test]
    async fn test_quota_rejection_creates_nothing() {
        let api = Arc::new(FakeMachineApi::new());
        let store = Arc::new(MemorySessionStore::new());
        let registry = SessionRegistry::new(
            store.clone(),
            Provisioner::new(api.clone()),
            Arc::new(ActiveSessionQuota::new(store.clone())),
            RegistryConfig::default(),
        );

        registry.create_session(request("free")).await.unwrap();
        let err = registry.create_session(request("free")).await.unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
        assert_eq!(store.len().await, 1);
        assert_eq!(api.call_count("create"), 1);
    }

    /// Quota backend with lookup latency.
    struct SlowQuota(ActiveSessionQuota);

    #[async_trait::async_trait]
    impl QuotaService for SlowQuota {
        async fn check(&self, user_id: &str, tier: ResourceTier) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.check(user_id, tier).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_creates_respect_quota() {
        let api = Arc::new(FakeMachineApi::new());
        let store = Arc::new(MemorySessionStore::new());
        let registry = SessionRegistry::new(
            store.clone(),
            Provisioner::new(api.clone()),
            Arc::new(SlowQuota(ActiveSessionQuota::new(store.clone()))),
            RegistryConfig::default(),
        );

        let (first, second) = tokio::join!(
            registry.create_session(request("free")),
            registry.create_session(request("free"))
        );
        let rejected = [&first, &second]
            .iter()
            .filter(|r| matches!(r, Err(CoreError::QuotaExceeded(_))))
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(store.len().await, 1);
        assert_eq!(api.call_count("create"), 1);
        assert!(registry.admissions.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let h = harness();
        let session = h.registry.create_session(request("free")).await.unwrap();

        let destroyed = h.registry.destroy_session(&session.session_id).await.unwrap();
        assert_eq!(destroyed.status, SessionStatus::Terminated);
        assert!(destroyed.ended_at.is_some());
        assert!(h.api.machine("m-1").is_none());

        let again = h.registry.destroy_session(&session.session_id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Terminated);
        assert_eq!(h.api.call_count("delete"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_destroy_tears_down_once() {
        let h = harness();
        let session = h.registry.create_session(request("free")).await.unwrap();
        let id = session.session_id;

        let (first, second) = tokio::join!(
            h.registry.destroy_session(&id),
            h.registry.destroy_session(&id)
        );
        // The loser reports whatever the winner has reached so far
        let statuses = [first.unwrap().status, second.unwrap().status];
        assert!(statuses.contains(&SessionStatus::Terminated));
        assert!(statuses
            .iter()
            .all(|s| matches!(s, SessionStatus::Terminating | SessionStatus::Terminated)));
        let current = h.registry.get_session_status(&id).await.unwrap().unwrap();
        assert_eq!(current.status, SessionStatus::Terminated);
        assert_eq!(h.api.call_count("stop"), 1);
        assert_eq!(h.api.call_count("delete"), 1);
    }

    #[tokio::test]
    async fn test_destroy_unknown_session() {
        let h = harness();
        let err = h
            .registry
            .destroy_session(&SessionId::from("nonexistent"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_with_instance_already_gone() {
        let h = harness();
        let session = h.registry.create_session(request("free")).await.unwrap();
        h.api.forget("m-1");

        let destroyed = h.registry.destroy_session(&session.session_id).await.unwrap();
        assert_eq!(destroyed.status, SessionStatus::Terminated);
        assert_eq!(h.api.call_count("find_by_name"), 1);
    }

    #[tokio::test]
    async fn test_destroy_errored_session() {
        let h = harness();
        let session = h.registry.create_session(request("free")).await.unwrap();
        h.registry
            .report_failure(&session.session_id, "dev server crashed")
            .await
            .unwrap();

        let destroyed = h.registry.destroy_session(&session.session_id).await.unwrap();
        assert_eq!(destroyed.status, SessionStatus::Terminated);
        // Error clears the recorded id, so the instance is found by name
        assert!(h.api.machine("m-1").is_none());
    }

    #[tokio::test]
    async fn test_teardown_failure_moves_to_error() {
        let h = harness();
        let session = h.registry.create_session(request("free")).await.unwrap();
        h.api
            .fail_next("stop", MachineError::from_status(403, "forbidden"));

        let err = h.registry.destroy_session(&session.session_id).await.unwrap_err();
        assert!(matches!(err, CoreError::Machine(_)));
        let current = h.registry.get_session_status(&session.session_id).await.unwrap().unwrap();
        assert_eq!(current.status, SessionStatus::Error);

        // A later sweep can still finish the job
        let destroyed = h.registry.destroy_session(&session.session_id).await.unwrap();
        assert_eq!(destroyed.status, SessionStatus::Terminated);
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures() {
        let h = harness();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(h.registry.create_session(request("pro")).await.unwrap().session_id);
        }
        let past = Utc::now() - chrono::Duration::minutes(1);
        for id in &ids {
            h.store.set_expires_at(id, past).await.unwrap();
        }
        h.api
            .fail_next("get_state", MachineError::from_status(403, "forbidden"));

        let report = h.registry.cleanup_expired_sessions().await.unwrap();
        assert_eq!(report.examined, 3);
        assert_eq!(report.terminated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_status_changes_are_published() {
        let bus = ChannelBus::new(
            AccessPolicySet::default(),
            RateLimiter::new(RateLimitConfig::per_second(100)),
            BusConfig::default(),
        );
        let h = harness();
        let registry = h.registry.with_bus(bus.clone());

        let session = registry.create_session(request("free")).await.unwrap();
        let mut sub = bus
            .subscribe(
                &session_channel(session.session_id.as_str()),
                &Subject::user("U1").with_grant(session_channel(session.session_id.as_str())),
            )
            .unwrap();
        registry.destroy_session(&session.session_id).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let message = sub.recv().await.unwrap();
            let EventPayload::SessionStatus(event) = &message.body else {
                panic!("unexpected payload");
            };
            seen.push(event.status);
        }
        assert_eq!(seen, vec![SessionStatus::Terminating, SessionStatus::Terminated]);
    }
}
