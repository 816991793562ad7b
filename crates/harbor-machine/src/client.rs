//! HTTP client for a Machines-style compute REST API.
//!
//! Each method issues exactly one request; retries are added by
//! [`Provisioner`](crate::Provisioner).

use crate::error::{MachineError, Result};
use crate::provisioner::MachineApi;
use crate::request::{MachineInfo, MachineState, ProvisioningRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Connection settings for the compute API.
#[derive(Clone)]
pub struct MachinesConfig {
    /// Base URL, e.g. `https://api.machines.dev`.
    pub base_url: String,
    /// Application that owns the preview machines.
    pub app_name: String,
    /// Bearer token.
    pub api_token: String,
    /// Per-request timeout.
    pub call_timeout: Duration,
}

impl MachinesConfig {
    /// Create a config with the default 30s per-call timeout.
    pub fn new(
        base_url: impl Into<String>,
        app_name: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_name: app_name.into(),
            api_token: api_token.into(),
            call_timeout: crate::provisioner::DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for MachinesConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachinesConfig")
            .field("base_url", &self.base_url)
            .field("app_name", &self.app_name)
            .field("api_token", &"<redacted>")
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// [`MachineApi`] implementation over HTTP.
#[derive(Debug, Clone)]
pub struct MachinesClient {
    http: reqwest::Client,
    config: MachinesConfig,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: MachineState,
}

impl MachinesClient {
    /// Build a client.
    pub fn new(config: MachinesConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .map_err(|e| MachineError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    fn machines_url(&self) -> String {
        format!(
            "{}/v1/apps/{}/machines",
            self.config.base_url, self.config.app_name
        )
    }

    fn machine_url(&self, instance_id: &str) -> String {
        format!("{}/{}", self.machines_url(), instance_id)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = builder
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %body, "Compute API error response");
        Err(MachineError::from_status(status.as_u16(), body))
    }

    fn map_send_error(&self, e: reqwest::Error) -> MachineError {
        if e.is_timeout() {
            MachineError::Timeout(self.config.call_timeout)
        } else {
            MachineError::from(e)
        }
    }
}

/// Request body for machine creation.
fn create_body(request: &ProvisioningRequest) -> serde_json::Value {
    let services: Vec<_> = request
        .ports
        .iter()
        .map(|port| {
            json!({
                "internal_port": port,
                "protocol": "tcp",
                "ports": [{ "port": 443, "handlers": ["tls", "http"] }],
            })
        })
        .collect();

    json!({
        "name": request.name,
        "region": request.region,
        "config": {
            "image": request.image,
            "guest": {
                "cpu_kind": "shared",
                "cpus": request.resources.cpus,
                "memory_mb": request.resources.memory_mb,
            },
            "init": { "cap_add": request.capabilities },
            "env": request.env,
            "metadata": request.metadata,
            "services": services,
            "auto_destroy": true,
            "restart": { "policy": "no" },
        },
    })
}

#[async_trait]
impl MachineApi for MachinesClient {
    async fn create(&self, request: &ProvisioningRequest) -> Result<MachineInfo> {
        let response = self
            .send(self.http.post(self.machines_url()).json(&create_body(request)))
            .await?;
        response
            .json::<MachineInfo>()
            .await
            .map_err(|e| MachineError::Decode(e.to_string()))
    }

    async fn stop(&self, instance_id: &str) -> Result<()> {
        let url = format!("{}/stop", self.machine_url(instance_id));
        self.send(self.http.post(url)).await?;
        Ok(())
    }

    async fn delete(&self, instance_id: &str) -> Result<()> {
        let url = format!("{}?force=true", self.machine_url(instance_id));
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let response = self.send(self.http.get(self.machines_url())).await?;
        let machines = response
            .json::<Vec<MachineInfo>>()
            .await
            .map_err(|e| MachineError::Decode(e.to_string()))?;
        Ok(machines
            .into_iter()
            .find(|m| m.name == name && !m.state.is_gone())
            .map(|m| m.id))
    }

    async fn get_state(&self, instance_id: &str) -> Result<MachineState> {
        let response = self
            .send(self.http.get(self.machine_url(instance_id)))
            .await?;
        let body = response
            .json::<StateResponse>()
            .await
            .map_err(|e| MachineError::Decode(e.to_string()))?;
        Ok(body.state)
    }
}
