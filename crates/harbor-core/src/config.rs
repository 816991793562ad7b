//! Session registry configuration.

use crate::error::CoreError;
use std::collections::BTreeMap;

/// Configuration for [`SessionRegistry`](crate::SessionRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Image run by every preview instance (the bootstrap agent).
    pub image: String,
    /// Domain under which preview URLs are served.
    pub preview_domain: String,
    /// Ports requested for each instance before tier filtering.
    pub ports: Vec<u16>,
    /// Placement region (provider default when `None`).
    pub region: Option<String>,
    /// Base URL for pre-built snapshots; `{base}/{project_id}.tar.gz`.
    pub snapshot_url_base: Option<String>,
    /// Realtime endpoint the agent connects to.
    pub realtime_url: Option<String>,
    /// Extra environment passed to every instance.
    pub agent_env: BTreeMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            image: "harbor/agent:latest".to_string(),
            preview_domain: "preview.localhost".to_string(),
            ports: vec![3000, 5173, 8080],
            region: None,
            snapshot_url_base: None,
            realtime_url: None,
            agent_env: BTreeMap::new(),
        }
    }
}

impl RegistryConfig {
    /// Create a new config builder.
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image.trim().is_empty() {
            return Err(CoreError::Validation("image is required".into()));
        }
        if self.preview_domain.trim().is_empty() {
            return Err(CoreError::Validation("preview_domain is required".into()));
        }
        if self.preview_domain.contains("://") || self.preview_domain.contains('/') {
            return Err(CoreError::Validation(
                "preview_domain must be a bare host name".into(),
            ));
        }
        if self.ports.contains(&0) {
            return Err(CoreError::Validation("ports must be non-zero".into()));
        }
        Ok(())
    }

    /// Snapshot URL for a project, if snapshots are configured.
    pub fn snapshot_url(&self, project_id: &str) -> Option<String> {
        self.snapshot_url_base
            .as_ref()
            .map(|base| format!("{}/{project_id}.tar.gz", base.trim_end_matches('/')))
    }
}

/// Environment variables set on every preview instance and read back by
/// the bootstrap agent.
pub mod boot_env {
    pub const SESSION_ID: &str = "HARBOR_SESSION_ID";
    pub const PROJECT_ID: &str = "HARBOR_PROJECT_ID";
    pub const PREVIEW_DOMAIN: &str = "HARBOR_PREVIEW_DOMAIN";
    pub const PREVIEW_PORT: &str = "HARBOR_PREVIEW_PORT";
    pub const SNAPSHOT_URL: &str = "HARBOR_SNAPSHOT_URL";
    pub const REALTIME_URL: &str = "HARBOR_REALTIME_URL";
    /// Optional scoped token presented to the realtime endpoint.
    pub const REALTIME_TOKEN: &str = "HARBOR_REALTIME_TOKEN";
}

/// Builder for RegistryConfig.
#[derive(Debug, Default)]
pub struct RegistryConfigBuilder {
    config: RegistryConfig,
}

impl RegistryConfigBuilder {
    /// Set the instance image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.config.image = image.into();
        self
    }

    /// Set the preview domain.
    pub fn preview_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.preview_domain = domain.into();
        self
    }

    /// Replace the requested ports.
    pub fn ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.config.ports = ports.into_iter().collect();
        self
    }

    /// Set the placement region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Set the snapshot base URL.
    pub fn snapshot_url_base(mut self, url: impl Into<String>) -> Self {
        self.config.snapshot_url_base = Some(url.into());
        self
    }

    /// Set the realtime endpoint.
    pub fn realtime_url(mut self, url: impl Into<String>) -> Self {
        self.config.realtime_url = Some(url.into());
        self
    }

    /// Add an environment variable for every instance.
    pub fn agent_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.agent_env.insert(key.into(), value.into());
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<RegistryConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
