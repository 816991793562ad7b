//! Provisioning request and machine descriptor types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// CPU, memory and disk requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of vCPUs.
    pub cpus: u32,
    /// Memory in MB.
    pub memory_mb: u32,
    /// Root disk size in GB.
    pub disk_gb: u32,
}

/// Everything the compute API needs to create one preview instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    /// Unique instance name, used for lookup when the id is stale.
    pub name: String,
    /// Container image running the bootstrap agent.
    pub image: String,
    /// Preferred region, if any.
    pub region: Option<String>,
    /// Requested resources.
    pub resources: Resources,
    /// Internal ports to expose.
    pub ports: Vec<u16>,
    /// Extra capabilities requested for the container.
    pub capabilities: Vec<String>,
    /// Environment passed to the bootstrap agent.
    pub env: BTreeMap<String, String>,
    /// Audit metadata stamped onto the instance.
    pub metadata: BTreeMap<String, String>,
}

impl ProvisioningRequest {
    /// Create a request with no ports, capabilities or environment.
    pub fn new(name: impl Into<String>, image: impl Into<String>, resources: Resources) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            region: None,
            resources,
            ports: Vec::new(),
            capabilities: Vec::new(),
            env: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Request exposure of an internal port.
    pub fn port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    /// Request an additional capability.
    pub fn capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.push(cap.into());
        self
    }

    /// Set the preferred region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }
}

/// Lifecycle state reported by the compute API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    #[serde(other)]
    Unknown,
}

impl MachineState {
    /// Whether the instance has been torn down.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Destroying | Self::Destroyed)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A created instance as returned by the compute API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Provisioner-assigned instance id.
    pub id: String,
    /// Name supplied at creation.
    pub name: String,
    /// Current state.
    pub state: MachineState,
    /// Private network address, when assigned.
    #[serde(default)]
    pub private_ip: Option<String>,
}
