//! Server configuration.
//!
//! Configuration is loaded from `HARBOR_*` environment variables with
//! defaults suitable for local development.

use harbor_core::realtime::RateLimitConfig;
use harbor_core::{CoreError, RegistryConfig};
use harbor_machine::MachinesConfig;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Configuration error. Any of these aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("invalid registry configuration: {0}")]
    Registry(#[from] CoreError),
}

/// Configuration for the Harbor API server.
#[derive(Clone)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub listen_addr: SocketAddr,

    /// Compute API base URL, app and token.
    pub machines: MachinesConfig,

    /// Image every preview instance boots.
    pub agent_image: String,

    /// Domain preview URLs are served under.
    pub preview_domain: String,

    /// Region new instances are placed in.
    pub region: Option<String>,

    /// Base URL of published project snapshots.
    pub snapshot_url_base: Option<String>,

    /// Public URL of this server, handed to agents for file sync.
    pub public_url: Option<String>,

    /// Interval between expired-session sweeps.
    pub sweep_interval: Duration,

    /// Requests each user may make per minute.
    pub api_rate_limit: u32,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `HARBOR_LISTEN_ADDR` | `0.0.0.0:8080` |
    /// | `HARBOR_MACHINES_URL` | `https://api.machines.dev` |
    /// | `HARBOR_MACHINES_APP` | required |
    /// | `HARBOR_MACHINES_TOKEN` | required |
    /// | `HARBOR_AGENT_IMAGE` | `harbor/agent:latest` |
    /// | `HARBOR_PREVIEW_DOMAIN` | `preview.localhost` |
    /// | `HARBOR_REGION` | unset |
    /// | `HARBOR_SNAPSHOT_BASE_URL` | unset |
    /// | `HARBOR_PUBLIC_URL` | unset |
    /// | `HARBOR_SWEEP_SECS` | `60` |
    /// | `HARBOR_API_RATE_LIMIT` | `120` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));
        let parsed = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            get(key)
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::Invalid { var: key, value })
                })
                .transpose()
        };

        let listen_addr = match get("HARBOR_LISTEN_ADDR") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: "HARBOR_LISTEN_ADDR",
                value,
            })?,
            None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
        };
        let defaults = RegistryConfig::default();

        let config = Self {
            listen_addr,
            machines: MachinesConfig::new(
                get("HARBOR_MACHINES_URL").unwrap_or_else(|| "https://api.machines.dev".into()),
                required("HARBOR_MACHINES_APP")?,
                required("HARBOR_MACHINES_TOKEN")?,
            ),
            agent_image: get("HARBOR_AGENT_IMAGE").unwrap_or(defaults.image),
            preview_domain: get("HARBOR_PREVIEW_DOMAIN").unwrap_or(defaults.preview_domain),
            region: get("HARBOR_REGION"),
            snapshot_url_base: get("HARBOR_SNAPSHOT_BASE_URL"),
            public_url: get("HARBOR_PUBLIC_URL").map(|u| u.trim_end_matches('/').to_string()),
            sweep_interval: Duration::from_secs(parsed("HARBOR_SWEEP_SECS")?.unwrap_or(60)),
            api_rate_limit: match parsed("HARBOR_API_RATE_LIMIT")? {
                Some(limit) => u32::try_from(limit).map_err(|_| ConfigError::Invalid {
                    var: "HARBOR_API_RATE_LIMIT",
                    value: limit.to_string(),
                })?,
                None => 120,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "HARBOR_SWEEP_SECS",
                value: "0".into(),
            });
        }
        if self.api_rate_limit == 0 {
            return Err(ConfigError::Invalid {
                var: "HARBOR_API_RATE_LIMIT",
                value: "0".into(),
            });
        }
        if let Some(url) = &self.public_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ConfigError::Invalid {
                    var: "HARBOR_PUBLIC_URL",
                    value: url.clone(),
                });
            }
        }
        self.registry_config()?;
        Ok(())
    }

    /// Registry settings derived from this configuration.
    pub fn registry_config(&self) -> Result<RegistryConfig, ConfigError> {
        let mut builder = RegistryConfig::builder()
            .image(&self.agent_image)
            .preview_domain(&self.preview_domain);
        if let Some(region) = &self.region {
            builder = builder.region(region);
        }
        if let Some(base) = &self.snapshot_url_base {
            builder = builder.snapshot_url_base(base);
        }
        if let Some(url) = &self.public_url {
            builder = builder.realtime_url(url);
        }
        Ok(builder.build()?)
    }

    /// Per-user API budget.
    pub fn api_rate(&self) -> RateLimitConfig {
        RateLimitConfig::new(self.api_rate_limit, Duration::from_secs(60))
    }
}
