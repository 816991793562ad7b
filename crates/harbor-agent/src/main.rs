//! Harbor bootstrap agent.
//!
//! Runs inside every preview sandbox:
//!
//! 1. Hydrates the workspace (snapshot → storage → records → scaffold)
//! 2. Starts and supervises the dev server
//! 3. Applies realtime file events and debounces them into hot reloads
//! 4. Serves `/health` and proxies preview traffic to the dev server

mod applier;
mod env;
mod http;
mod realtime;
mod remote;
mod supervisor;

use applier::{seed_workspace, LocalApplier};
use env::BootEnv;
use harbor_core::files::{
    HydrationConfig, Hydrator, RecordsStrategy, SnapshotStrategy, StorageStrategy,
};
use harbor_core::realtime::{
    HotReloadConfig, HotReloadCoordinator, RebuildTrigger, ReloadPublisher,
};
use harbor_machine::{MachinesClient, Provisioner};
use http::AgentState;
use realtime::RealtimeClient;
use remote::{
    HttpObjectStorage, HttpRebuildTrigger, HttpRecordSource, HttpReloadPublisher,
    LogReloadPublisher, ServiceIdentity,
};
use std::sync::Arc;
use supervisor::{DevServerSupervisor, SupervisorConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("harbor_agent=debug".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let env = BootEnv::from_env()?;
    tracing::info!(
        session_id = %env.session_id,
        project_id = %env.project_id,
        workspace = %env.workspace.display(),
        preview_port = env.preview_port,
        "Starting Harbor agent"
    );

    let identity = ServiceIdentity {
        session_id: env.session_id.clone(),
        project_id: env.project_id.clone(),
        token: env.realtime_token.clone(),
    };

    // Hydrate
    tokio::fs::create_dir_all(&env.workspace).await?;
    let mut hydrator = Hydrator::new();
    if let Some(url) = &env.snapshot_url {
        hydrator = hydrator.with(SnapshotStrategy::new(url, HydrationConfig::default())?);
    }
    if let Some(url) = &env.storage_url {
        hydrator = hydrator.with(StorageStrategy::new(Arc::new(HttpObjectStorage::new(url)?)));
    }
    if let Some(url) = &env.realtime_url {
        let source = HttpRecordSource::new(url, identity.clone())?;
        hydrator = hydrator.with(RecordsStrategy::new(Arc::new(source)));
    }
    let report = hydrator.hydrate(&env.project_id, &env.workspace).await?;
    tracing::info!(
        source = report.source,
        files = report.files_written,
        stages = report.attempts.len(),
        "Workspace hydrated"
    );

    // Hot reload
    let publisher: Arc<dyn ReloadPublisher> = match &env.realtime_url {
        Some(url) => Arc::new(HttpReloadPublisher::new(url, identity.clone())?),
        None => Arc::new(LogReloadPublisher),
    };
    let trigger: Option<Arc<dyn RebuildTrigger>> = match &env.rebuild_url {
        Some(url) => Some(Arc::new(HttpRebuildTrigger::new(url)?)),
        None => None,
    };
    let reload_config = HotReloadConfig::default();
    let ignored_dirs = reload_config.ignored_dirs.clone();
    let (reload, reload_task) =
        HotReloadCoordinator::spawn(&env.project_id, reload_config, publisher, trigger);
    seed_workspace(&env.workspace, &reload, &ignored_dirs).await?;

    // Dev server
    let (dev_server, dev_server_task) = DevServerSupervisor::spawn(SupervisorConfig::new(
        &env.dev_command,
        &env.workspace,
        env.preview_port,
    ));

    let mut state = AgentState::new(&env, dev_server.ready_flag())?;

    // Realtime
    let realtime_task = match &env.realtime_url {
        Some(url) => {
            let applier = LocalApplier::new(&env.workspace).with_reload(reload.clone());
            let (link, task) = RealtimeClient::new(url, identity.clone())?.spawn(applier);
            state = state.with_realtime(link);
            Some(task)
        }
        None => {
            tracing::warn!("HARBOR_REALTIME_URL not set; file events will not be applied");
            None
        }
    };

    if let Some(machines) = env.machines.clone() {
        let client = MachinesClient::new(machines)?;
        state = state.with_replay(Provisioner::new(Arc::new(client)));
    }

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
    };
    http::serve(state, env.listen_addr, shutdown).await?;

    if let Some(task) = realtime_task {
        task.abort();
        let _ = task.await;
    }
    dev_server.shutdown();
    let _ = dev_server_task.await;
    tracing::info!(starts = dev_server.starts(), "Dev server stopped");
    drop(reload);
    let _ = reload_task.await;

    tracing::info!("Agent shutdown complete");
    Ok(())
}
