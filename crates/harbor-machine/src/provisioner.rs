//! Machine provisioner: the compute API seam plus its retrying wrapper.

use crate::error::{MachineError, Result};
use crate::request::{MachineInfo, MachineState, ProvisioningRequest};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Raw operations of an external compute-machine API.
///
/// Implementations make a single network call per method and report
/// failures through [`MachineError`]; retries and idempotent teardown live
/// in [`Provisioner`].
#[async_trait]
pub trait MachineApi: Send + Sync {
    /// Create and start an instance.
    async fn create(&self, request: &ProvisioningRequest) -> Result<MachineInfo>;

    /// Stop a running instance.
    async fn stop(&self, instance_id: &str) -> Result<()>;

    /// Delete an instance.
    async fn delete(&self, instance_id: &str) -> Result<()>;

    /// Look up an instance id by name.
    async fn find_by_name(&self, name: &str) -> Result<Option<String>>;

    /// Current state of an instance.
    async fn get_state(&self, instance_id: &str) -> Result<MachineState>;
}

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry-wrapped client over a [`MachineApi`].
///
/// Every call is bounded by a per-call timeout and retried according to the
/// [`RetryPolicy`]. `stop` and `delete` treat "already gone" as success.
#[derive(Clone)]
pub struct Provisioner {
    api: Arc<dyn MachineApi>,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl Provisioner {
    /// Wrap an API with the default retry policy and call timeout.
    pub fn new(api: Arc<dyn MachineApi>) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The retry policy in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MachineError::Timeout(self.call_timeout)),
        }
    }

    /// Create an instance.
    pub async fn create(&self, request: &ProvisioningRequest) -> Result<MachineInfo> {
        crate::tier::validate(&request.resources)?;
        let start = std::time::Instant::now();
        tracing::info!(
            name = %request.name,
            cpus = request.resources.cpus,
            memory_mb = request.resources.memory_mb,
            "Provisioning machine"
        );
        let info = self
            .retry
            .run("machine.create", || self.timed(self.api.create(request)))
            .await?;
        tracing::info!(
            name = %request.name,
            instance_id = %info.id,
            state = %info.state,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Machine provisioned"
        );
        Ok(info)
    }

    /// Stop an instance; an instance that is already gone counts as stopped.
    pub async fn stop(&self, instance_id: &str) -> Result<()> {
        tracing::debug!(instance_id, "Stopping machine");
        let result = self
            .retry
            .run("machine.stop", || self.timed(self.api.stop(instance_id)))
            .await;
        tolerate_gone(instance_id, "stop", result)
    }

    /// Delete an instance; an instance that is already gone counts as deleted.
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        tracing::debug!(instance_id, "Deleting machine");
        let result = self
            .retry
            .run("machine.delete", || self.timed(self.api.delete(instance_id)))
            .await;
        tolerate_gone(instance_id, "delete", result)
    }

    /// Look up an instance id by name.
    pub async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        self.retry
            .run("machine.find_by_name", || {
                self.timed(self.api.find_by_name(name))
            })
            .await
    }

    /// Current state of an instance.
    pub async fn get_state(&self, instance_id: &str) -> Result<MachineState> {
        self.retry
            .run("machine.get_state", || {
                self.timed(self.api.get_state(instance_id))
            })
            .await
    }
}

/// Map "already gone" responses of teardown calls to success.
///
/// 404 means the instance no longer exists; 409/412 mean it is not in a
/// state where the transition applies (already stopped / being destroyed).
fn tolerate_gone(instance_id: &str, op: &str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(MachineError::NotFound(_)) => {
            tracing::debug!(instance_id, op, "Machine already gone");
            Ok(())
        }
        Err(MachineError::Api { status, .. }) if status == 409 || status == 412 => {
            tracing::debug!(instance_id, op, status, "Machine already in target state");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(any(test, feature = "testing"))]
pub use fake::FakeMachineApi;

#[cfg(any(test, feature = "testing"))]
mod fake {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory [`MachineApi`] for tests.
    ///
    /// Failures can be queued per operation; each queued error is returned
    /// once, in order, before the operation starts succeeding.
    #[derive(Default)]
    pub struct FakeMachineApi {
        machines: Mutex<HashMap<String, MachineInfo>>,
        failures: Mutex<HashMap<&'static str, VecDeque<MachineError>>>,
        calls: Mutex<Vec<String>>,
        next_id: AtomicU64,
    }

    impl FakeMachineApi {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue an error for the next call of `op`
        /// (`create`, `stop`, `delete`, `find_by_name`, `get_state`).
        pub fn fail_next(&self, op: &'static str, error: MachineError) {
            self.failures
                .lock()
                .unwrap()
                .entry(op)
                .or_default()
                .push_back(error);
        }

        /// Every call made so far, formatted as `op:argument`.
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        /// Number of calls made to `op`.
        pub fn call_count(&self, op: &str) -> usize {
            let prefix = format!("{op}:");
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.starts_with(&prefix))
                .count()
        }

        /// Snapshot of a stored machine.
        pub fn machine(&self, id: &str) -> Option<MachineInfo> {
            self.machines.lock().unwrap().get(id).cloned()
        }

        /// Remove a machine behind the caller's back.
        pub fn forget(&self, id: &str) {
            self.machines.lock().unwrap().remove(id);
        }

        fn record(&self, op: &'static str, arg: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{op}:{arg}"));
            match self
                .failures
                .lock()
                .unwrap()
                .get_mut(op)
                .and_then(VecDeque::pop_front)
            {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MachineApi for FakeMachineApi {
        async fn create(&self, request: &ProvisioningRequest) -> Result<MachineInfo> {
            self.record("create", &request.name)?;
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let info = MachineInfo {
                id: format!("m-{n}"),
                name: request.name.clone(),
                state: MachineState::Started,
                private_ip: Some(format!("fdaa::{n}")),
            };
            self.machines
                .lock()
                .unwrap()
                .insert(info.id.clone(), info.clone());
            Ok(info)
        }

        async fn stop(&self, instance_id: &str) -> Result<()> {
            self.record("stop", instance_id)?;
            let mut machines = self.machines.lock().unwrap();
            let machine = machines
                .get_mut(instance_id)
                .ok_or_else(|| MachineError::NotFound(instance_id.to_string()))?;
            machine.state = MachineState::Stopped;
            Ok(())
        }

        async fn delete(&self, instance_id: &str) -> Result<()> {
            self.record("delete", instance_id)?;
            self.machines
                .lock()
                .unwrap()
                .remove(instance_id)
                .map(|_| ())
                .ok_or_else(|| MachineError::NotFound(instance_id.to_string()))
        }

        async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
            self.record("find_by_name", name)?;
            Ok(self
                .machines
                .lock()
                .unwrap()
                .values()
                .find(|m| m.name == name)
                .map(|m| m.id.clone()))
        }

        async fn get_state(&self, instance_id: &str) -> Result<MachineState> {
            self.record("get_state", instance_id)?;
            self.machines
                .lock()
                .unwrap()
                .get(instance_id)
                .map(|m| m.state)
                .ok_or_else(|| MachineError::NotFound(instance_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Resources;

    fn provisioner(api: Arc<FakeMachineApi>) -> Provisioner {
        Provisioner::new(api).with_retry(
            RetryPolicy::with_attempts(3)
                .delays(Duration::from_millis(10), Duration::from_millis(40))
                .without_jitter(),
        )
    }

    fn request() -> ProvisioningRequest {
        ProvisioningRequest::new(
            "preview-s1",
            "harbor/agent",
            Resources {
                cpus: 1,
                memory_mb: 512,
                disk_gb: 1,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_transport_errors() {
        let api = Arc::new(FakeMachineApi::new());
        api.fail_next("create", MachineError::Transport("reset".into()));
        let info = provisioner(api.clone()).create(&request()).await.unwrap();
        assert_eq!(info.state, MachineState::Started);
        assert_eq!(api.call_count("create"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_rejection_not_retried() {
        let api = Arc::new(FakeMachineApi::new());
        api.fail_next("create", MachineError::from_status(400, "bad image"));
        let err = provisioner(api.clone()).create(&request()).await.unwrap_err();
        assert!(matches!(err, MachineError::Api { status: 400, .. }));
        assert_eq!(api.call_count("create"), 1);
    }

    #[tokio::test]
    async fn test_create_validates_resources_first() {
        let api = Arc::new(FakeMachineApi::new());
        let mut req = request();
        req.resources.memory_mb = 16_384;
        let err = provisioner(api.clone()).create(&req).await.unwrap_err();
        assert!(matches!(err, MachineError::Validation(_)));
        assert_eq!(api.call_count("create"), 0);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let api = Arc::new(FakeMachineApi::new());
        let p = provisioner(api.clone());
        let info = p.create(&request()).await.unwrap();

        p.stop(&info.id).await.unwrap();
        p.delete(&info.id).await.unwrap();
        // Second round hits 404s and still succeeds.
        p.stop(&info.id).await.unwrap();
        p.delete(&info.id).await.unwrap();
        assert!(api.machine(&info.id).is_none());
    }

    #[tokio::test]
    async fn test_stop_conflict_treated_as_stopped() {
        let api = Arc::new(FakeMachineApi::new());
        api.fail_next("stop", MachineError::from_status(412, "not started"));
        provisioner(api).stop("m-9").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_by_name() {
        let api = Arc::new(FakeMachineApi::new());
        let p = provisioner(api);
        let info = p.create(&request()).await.unwrap();
        assert_eq!(p.find_by_name("preview-s1").await.unwrap(), Some(info.id));
        assert_eq!(p.find_by_name("preview-none").await.unwrap(), None);
    }

    struct SlowApi;

    #[async_trait]
    impl MachineApi for SlowApi {
        async fn create(&self, _request: &ProvisioningRequest) -> Result<MachineInfo> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(MachineError::Transport("unreachable".into()))
        }
        async fn stop(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn find_by_name(&self, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn get_state(&self, _id: &str) -> Result<MachineState> {
            Ok(MachineState::Unknown)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_timeout_counts_as_attempt() {
        let p = Provisioner::new(Arc::new(SlowApi))
            .with_call_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::with_attempts(2).without_jitter());
        let err = p.create(&request()).await.unwrap_err();
        assert!(matches!(err, MachineError::Timeout(_)));
    }
}
