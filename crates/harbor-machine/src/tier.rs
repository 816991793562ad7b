//! Resource tier policy.
//!
//! Maps a plan tier name to the CPU, memory, disk and security profile a
//! preview instance may use, and shapes provisioning requests to fit it.
//! Resolution never fails: an unknown tier falls back to the most
//! restrictive one.

use crate::error::{MachineError, Result};
use crate::request::{ProvisioningRequest, Resources};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hard platform bound on vCPUs.
pub const CPU_BOUNDS: (u32, u32) = (1, 8);

/// Hard platform bound on memory (MB).
pub const MEMORY_BOUNDS_MB: (u32, u32) = (128, 4096);

/// Hard platform bound on root disk (GB).
pub const DISK_BOUNDS_GB: (u32, u32) = (1, 50);

/// Named resource tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    Free,
    Pro,
    Team,
}

/// Security profile applied to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// No extra capabilities, dev-server port only.
    Restricted,
    /// Low ports may be bound.
    Standard,
    /// Low ports and ptrace for debuggers.
    Elevated,
}

impl SecurityProfile {
    /// Capabilities a container under this profile may hold.
    pub fn allowed_capabilities(&self) -> &'static [&'static str] {
        match self {
            Self::Restricted => &[],
            Self::Standard => &["NET_BIND_SERVICE"],
            Self::Elevated => &["NET_BIND_SERVICE", "SYS_PTRACE"],
        }
    }

    /// Profile name used in audit metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Standard => "standard",
            Self::Elevated => "elevated",
        }
    }
}

/// Limits bundled with a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    /// Resources granted to each instance.
    pub resources: Resources,
    /// Security profile of the container.
    pub security_profile: SecurityProfile,
    /// Hours until the session expires.
    pub max_duration_hours: u32,
    /// Internal ports the instance may expose. The first is the preview port.
    pub allowed_ports: &'static [u16],
    /// Non-terminal sessions a single user may hold.
    pub max_concurrent_sessions: usize,
}

impl ResourceTier {
    /// Most restrictive tier, used for unknown names.
    pub const DEFAULT: ResourceTier = ResourceTier::Free;

    /// Resolve a tier by name (case-insensitive).
    ///
    /// Unknown names resolve to [`ResourceTier::DEFAULT`].
    pub fn resolve(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "pro" => Self::Pro,
            "team" | "enterprise" => Self::Team,
            other => {
                tracing::warn!(tier = %other, "Unknown resource tier, using most restrictive");
                Self::DEFAULT
            }
        }
    }

    /// Limits for this tier.
    pub fn limits(&self) -> TierLimits {
        match self {
            Self::Free => TierLimits {
                resources: Resources {
                    cpus: 1,
                    memory_mb: 512,
                    disk_gb: 1,
                },
                security_profile: SecurityProfile::Restricted,
                max_duration_hours: 1,
                allowed_ports: &[3000],
                max_concurrent_sessions: 1,
            },
            Self::Pro => TierLimits {
                resources: Resources {
                    cpus: 2,
                    memory_mb: 2048,
                    disk_gb: 5,
                },
                security_profile: SecurityProfile::Standard,
                max_duration_hours: 4,
                allowed_ports: &[3000, 5173, 8080],
                max_concurrent_sessions: 3,
            },
            Self::Team => TierLimits {
                resources: Resources {
                    cpus: 4,
                    memory_mb: 4096,
                    disk_gb: 10,
                },
                security_profile: SecurityProfile::Elevated,
                max_duration_hours: 8,
                allowed_ports: &[3000, 4000, 5173, 8080],
                max_concurrent_sessions: 10,
            },
        }
    }

    /// Preview port for this tier.
    pub fn preview_port(&self) -> u16 {
        self.limits().allowed_ports[0]
    }

    /// Tier name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Team => "team",
        }
    }
}

impl fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reject resources outside the platform's hard bounds.
///
/// This is a caller error and must not be retried.
pub fn validate(resources: &Resources) -> Result<()> {
    check_bound("cpus", resources.cpus, CPU_BOUNDS)?;
    check_bound("memory_mb", resources.memory_mb, MEMORY_BOUNDS_MB)?;
    check_bound("disk_gb", resources.disk_gb, DISK_BOUNDS_GB)?;
    Ok(())
}

fn check_bound(field: &str, value: u32, (min, max): (u32, u32)) -> Result<()> {
    if value < min || value > max {
        return Err(MachineError::Validation(format!(
            "{field} = {value} outside {min}..={max}"
        )));
    }
    Ok(())
}

/// Shape a request to a tier, returning a new request.
///
/// Resources are replaced by the tier's, ports and capabilities are filtered
/// to what the tier allows (falling back to the preview port if nothing
/// survives), and tier metadata is stamped for audit.
pub fn apply_to_request(request: &ProvisioningRequest, tier: ResourceTier) -> ProvisioningRequest {
    let limits = tier.limits();
    let mut shaped = request.clone();

    shaped.resources = limits.resources;

    shaped.ports = request
        .ports
        .iter()
        .copied()
        .filter(|p| limits.allowed_ports.contains(p))
        .collect();
    shaped.ports.sort_unstable();
    shaped.ports.dedup();
    if shaped.ports.is_empty() {
        shaped.ports.push(tier.preview_port());
    }

    let allowed_caps = limits.security_profile.allowed_capabilities();
    shaped.capabilities = request
        .capabilities
        .iter()
        .filter(|c| allowed_caps.contains(&c.as_str()))
        .cloned()
        .collect();

    let dropped_ports = request.ports.len().saturating_sub(shaped.ports.len());
    let dropped_caps = request.capabilities.len() - shaped.capabilities.len();
    if dropped_ports > 0 || dropped_caps > 0 {
        tracing::debug!(
            tier = %tier,
            dropped_ports,
            dropped_caps,
            "Filtered provisioning request to tier policy"
        );
    }

    shaped
        .metadata
        .insert("harbor.tier".into(), tier.as_str().into());
    shaped.metadata.insert(
        "harbor.security_profile".into(),
        limits.security_profile.as_str().into(),
    );
    shaped.metadata.insert(
        "harbor.max_duration_hours".into(),
        limits.max_duration_hours.to_string(),
    );
    shaped
}
