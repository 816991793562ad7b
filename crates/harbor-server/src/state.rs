//! Shared application state.

use crate::config::{ConfigError, ServerConfig};
use harbor_core::files::{FileSyncService, MemoryFileStore};
use harbor_core::realtime::{AccessPolicySet, BusConfig, ChannelBus, RateLimitConfig, RateLimiter};
use harbor_core::{ActiveSessionQuota, MemorySessionStore, RegistryConfig, SessionRegistry};
use harbor_machine::{MachineApi, MachinesClient, Provisioner};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Interval between rate-limit window evictions.
const LIMITER_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Services shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub files: FileSyncService,
    pub bus: ChannelBus,
    /// Per-user budget at the API boundary.
    pub api_limiter: RateLimiter,
}

impl AppState {
    /// Build the production state from `config`.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigError> {
        let client = MachinesClient::new(config.machines.clone()).map_err(|e| {
            ConfigError::Invalid {
                var: "HARBOR_MACHINES_URL",
                value: e.to_string(),
            }
        })?;
        Ok(Self::with_machine_api(
            Arc::new(client),
            config.registry_config()?,
            config.api_rate(),
        ))
    }

    /// Build state over any compute API with in-memory stores.
    pub fn with_machine_api(
        api: Arc<dyn MachineApi>,
        registry_config: RegistryConfig,
        api_rate: RateLimitConfig,
    ) -> Self {
        let bus = ChannelBus::new(
            AccessPolicySet::default(),
            RateLimiter::new(RateLimitConfig::default()),
            BusConfig::default(),
        );

        let sessions = Arc::new(MemorySessionStore::new());
        let registry = SessionRegistry::new(
            sessions.clone(),
            Provisioner::new(api),
            Arc::new(ActiveSessionQuota::new(sessions)),
            registry_config,
        )
        .with_bus(bus.clone());

        let files = FileSyncService::new(Arc::new(MemoryFileStore::new())).with_bus(bus.clone());

        Self {
            registry: Arc::new(registry),
            files,
            bus,
            api_limiter: RateLimiter::new(api_rate),
        }
    }

    /// Start the expiry sweep and rate-limit evictions.
    pub fn spawn_background(&self, sweep_interval: Duration) -> Vec<JoinHandle<()>> {
        tracing::info!(
            sweep_secs = sweep_interval.as_secs(),
            "Starting background tasks"
        );
        vec![
            self.registry.clone().spawn_cleanup_task(sweep_interval),
            self.bus.limiter().spawn_sweeper(LIMITER_SWEEP_INTERVAL),
            self.api_limiter.spawn_sweeper(LIMITER_SWEEP_INTERVAL),
        ]
    }
}
