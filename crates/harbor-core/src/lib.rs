//! # harbor-core
//!
//! Session lifecycle, versioned file synchronization and realtime channels
//! for Harbor preview sandboxes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    harbor-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ SessionRegistry │────▶│  SessionStore            │   │
//! │  │ - create()      │     │  (CAS on status)         │   │
//! │  │ - destroy()     │     └──────────────────────────┘   │
//! │  │ - cleanup()     │────▶ Provisioner (harbor-machine)  │
//! │  └─────────────────┘                                    │
//! │           │ session:{id}                                 │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   ChannelBus    │◀────│  FileSyncService         │   │
//! │  │ - subscribe()   │     │  - upsert() / delete()   │   │
//! │  │ - publish()     │     │  - bulk_upsert()         │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │ project:{id}:files       │ FileStore (CAS)   │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!             │
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │        harbor-agent (guest): Hydrator, HotReload         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use harbor_core::{
//!     ActiveSessionQuota, CreateSessionRequest, MemorySessionStore, RegistryConfig,
//!     SessionRegistry,
//! };
//! use harbor_machine::{MachinesClient, MachinesConfig, Provisioner};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let api = MachinesClient::new(MachinesConfig::new("https://api.machines.dev", "previews", "token"))?;
//! let store = Arc::new(MemorySessionStore::new());
//! let registry = SessionRegistry::new(
//!     store.clone(),
//!     Provisioner::new(Arc::new(api)),
//!     Arc::new(ActiveSessionQuota::new(store)),
//!     RegistryConfig::builder().preview_domain("preview.example.com").build()?,
//! );
//!
//! let session = registry
//!     .create_session(CreateSessionRequest {
//!         project_id: "P1".into(),
//!         user_id: "U1".into(),
//!         device_type: "desktop".into(),
//!         tier: Some("free".into()),
//!     })
//!     .await?;
//! println!("Preview at {:?}", session.container_url);
//!
//! registry.destroy_session(&session.session_id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Session Lifecycle**: pending → active → terminating → terminated, with
//!   `error` reachable from every live state and idempotent teardown
//! - **Optimistic Concurrency**: per-path versions checked by one atomic
//!   compare-and-swap; bulk writes commit all-or-nothing
//! - **Realtime Channels**: glob-matched access policies, bounded queues,
//!   per-key rate limits and capped reconnect backoff
//! - **Hydration**: snapshot, storage, records and scaffold stages tried in
//!   order

mod config;
mod error;
mod quota;
mod registry;
mod session;
mod store;

pub mod files;
pub mod realtime;

pub use config::{boot_env, RegistryConfig, RegistryConfigBuilder};
pub use error::{CoreError, Result};
pub use quota::{ActiveSessionQuota, QuotaService, Unlimited};
pub use registry::{CleanupOutcome, CleanupReport, SessionRegistry};
pub use session::{
    CreateSessionRequest, PreviewSession, PublicSession, SessionId, SessionStatus, SessionUpdate,
};
pub use store::{MemorySessionStore, SessionStore};
