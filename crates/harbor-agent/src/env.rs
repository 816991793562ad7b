//! Boot environment.
//!
//! Everything the agent needs is injected as environment variables when the
//! instance is provisioned.

use harbor_core::boot_env;
use harbor_machine::MachinesConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Boot environment error. Any of these aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Configuration for one sandbox boot.
#[derive(Debug, Clone)]
pub struct BootEnv {
    pub session_id: String,
    pub project_id: String,
    pub preview_domain: String,
    /// Port the dev server listens on.
    pub preview_port: u16,
    /// Address of the health/proxy server.
    pub listen_addr: SocketAddr,
    /// Directory the project is hydrated into.
    pub workspace: PathBuf,
    /// Shell command starting the dev server.
    pub dev_command: String,
    pub snapshot_url: Option<String>,
    /// Base URL of the Harbor API (file records, realtime, reload publish).
    pub realtime_url: Option<String>,
    pub realtime_token: Option<String>,
    /// Base URL of the object storage gateway.
    pub storage_url: Option<String>,
    /// Endpoint asked to rebuild after a reload batch.
    pub rebuild_url: Option<String>,
    /// Compute API credentials, used for cross-instance replay lookups.
    pub machines: Option<MachinesConfig>,
}

impl BootEnv {
    /// Load from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `HARBOR_SESSION_ID` | required |
    /// | `HARBOR_PROJECT_ID` | required |
    /// | `HARBOR_PREVIEW_DOMAIN` | `preview.localhost` |
    /// | `HARBOR_PREVIEW_PORT` | `3000` |
    /// | `HARBOR_AGENT_ADDR` | `0.0.0.0:8080` |
    /// | `HARBOR_WORKSPACE` | `/workspace` |
    /// | `HARBOR_DEV_COMMAND` | `npm install && npm run dev` |
    /// | `HARBOR_SNAPSHOT_URL` | unset |
    /// | `HARBOR_REALTIME_URL` | unset |
    /// | `HARBOR_REALTIME_TOKEN` | unset |
    /// | `HARBOR_STORAGE_URL` | unset |
    /// | `HARBOR_REBUILD_URL` | unset |
    /// | `HARBOR_MACHINES_URL`, `HARBOR_MACHINES_APP`, `HARBOR_MACHINES_TOKEN` | unset |
    pub fn from_env() -> Result<Self, EnvError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EnvError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(EnvError::Missing(key));

        let preview_port = match get(boot_env::PREVIEW_PORT) {
            Some(value) => value.parse().map_err(|_| EnvError::Invalid {
                var: boot_env::PREVIEW_PORT,
                value,
            })?,
            None => 3000,
        };
        let listen_addr = match get("HARBOR_AGENT_ADDR") {
            Some(value) => value.parse().map_err(|_| EnvError::Invalid {
                var: "HARBOR_AGENT_ADDR",
                value,
            })?,
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
        };

        let machines = match (
            get("HARBOR_MACHINES_URL"),
            get("HARBOR_MACHINES_APP"),
            get("HARBOR_MACHINES_TOKEN"),
        ) {
            (Some(url), Some(app), Some(token)) => Some(MachinesConfig::new(url, app, token)),
            _ => None,
        };

        let env = Self {
            session_id: required(boot_env::SESSION_ID)?,
            project_id: required(boot_env::PROJECT_ID)?,
            preview_domain: get(boot_env::PREVIEW_DOMAIN)
                .unwrap_or_else(|| "preview.localhost".to_string()),
            preview_port,
            listen_addr,
            workspace: get("HARBOR_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/workspace")),
            dev_command: get("HARBOR_DEV_COMMAND")
                .unwrap_or_else(|| "npm install && npm run dev".to_string()),
            snapshot_url: get(boot_env::SNAPSHOT_URL),
            realtime_url: get(boot_env::REALTIME_URL).map(|u| u.trim_end_matches('/').to_string()),
            realtime_token: get(boot_env::REALTIME_TOKEN),
            storage_url: get("HARBOR_STORAGE_URL").map(|u| u.trim_end_matches('/').to_string()),
            rebuild_url: get("HARBOR_REBUILD_URL"),
            machines,
        };
        env.validate()?;
        Ok(env)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), EnvError> {
        if self.preview_port == 0 {
            return Err(EnvError::Invalid {
                var: boot_env::PREVIEW_PORT,
                value: "0".into(),
            });
        }
        if let Some(url) = &self.realtime_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(EnvError::Invalid {
                    var: boot_env::REALTIME_URL,
                    value: url.clone(),
                });
            }
        }
        Ok(())
    }

    /// Host prefix identifying this session, `{session_id}-{port}`.
    pub fn host_prefix(&self) -> String {
        format!("{}-{}", self.session_id, self.preview_port)
    }
}
