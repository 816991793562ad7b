//! # harbor-machine
//!
//! Compute layer for Harbor preview sandboxes: resource tier policy and a
//! retry-wrapped client over an external compute-machine API.
//!
//! ## Quick Start
//!
//! ```no_run
//! use harbor_machine::{
//!     apply_to_request, MachinesClient, MachinesConfig, Provisioner, ProvisioningRequest,
//!     ResourceTier,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> harbor_machine::Result<()> {
//! let api = MachinesClient::new(MachinesConfig::new(
//!     "https://api.machines.dev",
//!     "harbor-previews",
//!     "token",
//! ))?;
//! let provisioner = Provisioner::new(Arc::new(api));
//!
//! let tier = ResourceTier::resolve("free");
//! let request = ProvisioningRequest::new("preview-1", "harbor/agent", tier.limits().resources)
//!     .port(3000);
//! let info = provisioner.create(&apply_to_request(&request, tier)).await?;
//!
//! // Teardown is idempotent
//! provisioner.stop(&info.id).await?;
//! provisioner.delete(&info.id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Tier Policy**: CPU/memory/disk/security limits per plan, unknown tiers
//!   fall back to the most restrictive profile
//! - **Bounded Retry**: jittered exponential backoff that never retries 4xx
//!   rejections
//! - **Idempotent Teardown**: stop/delete treat "already gone" as success

mod client;
mod error;
mod provisioner;
mod request;
mod retry;
mod tier;

pub use client::{MachinesClient, MachinesConfig};
pub use error::{MachineError, Result};
#[cfg(any(test, feature = "testing"))]
pub use provisioner::FakeMachineApi;
pub use provisioner::{MachineApi, Provisioner, DEFAULT_CALL_TIMEOUT};
pub use request::{MachineInfo, MachineState, ProvisioningRequest, Resources};
pub use retry::{RetryPolicy, Retryable};
pub use tier::{
    apply_to_request, validate, ResourceTier, SecurityProfile, TierLimits, CPU_BOUNDS,
    DISK_BOUNDS_GB, MEMORY_BOUNDS_MB,
};
