//! Dev server process supervision.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How the dev server is started and watched.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shell command, run with `sh -c`.
    pub command: String,
    pub workspace: PathBuf,
    /// Port the dev server is expected to listen on; exported as `PORT`.
    pub port: u16,
    /// Pause before restarting an exited process.
    pub restart_delay: Duration,
    /// Interval between readiness probes.
    pub probe_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(command: impl Into<String>, workspace: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            command: command.into(),
            workspace: workspace.into(),
            port,
            restart_delay: Duration::from_secs(2),
            probe_interval: Duration::from_millis(500),
        }
    }
}

/// Shared view of the supervised process.
#[derive(Clone)]
pub struct SupervisorHandle {
    ready: Arc<AtomicBool>,
    starts: Arc<AtomicU32>,
    shutdown: watch::Sender<bool>,
}

impl SupervisorHandle {
    /// Whether the dev server port currently accepts connections.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Flag tracking [`is_ready`](Self::is_ready), for sharing with the HTTP layer.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Number of times the process has been started.
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::Relaxed)
    }

    /// Kill the process and stop restarting it.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Keeps the dev server running and probes its port.
pub struct DevServerSupervisor;

impl DevServerSupervisor {
    pub fn spawn(config: SupervisorConfig) -> (SupervisorHandle, JoinHandle<()>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = SupervisorHandle {
            ready: Arc::new(AtomicBool::new(false)),
            starts: Arc::new(AtomicU32::new(0)),
            shutdown,
        };

        let probe = tokio::spawn(probe_loop(
            config.port,
            config.probe_interval,
            handle.ready.clone(),
            shutdown_rx.clone(),
        ));
        let starts = handle.starts.clone();
        let task = tokio::spawn(async move {
            run(config, starts, shutdown_rx).await;
            probe.abort();
        });
        (handle, task)
    }
}

async fn run(config: SupervisorConfig, starts: Arc<AtomicU32>, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&config.command)
            .current_dir(&config.workspace)
            .env("PORT", config.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, command = %config.command, "Failed to spawn dev server");
                if wait_or_shutdown(config.restart_delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        let start = starts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(pid = ?child.id(), start, command = %config.command, "Dev server started");
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, "stderr"));
        }

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(status) => tracing::warn!(code = ?status.code(), "Dev server exited"),
                    Err(e) => tracing::error!(error = %e, "Failed to wait on dev server"),
                }
            }
            _ = shutdown.changed() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill dev server");
                }
                break;
            }
        }

        if wait_or_shutdown(config.restart_delay, &mut shutdown).await {
            break;
        }
    }
    tracing::info!("Dev server supervisor stopped");
}

/// Sleep for `delay`; returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn forward_lines(stream: impl AsyncRead + Unpin, stream_name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "dev_server", stream = stream_name, "{line}");
    }
}

async fn probe_loop(
    port: u16,
    interval: Duration,
    ready: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
) {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut ticker = tokio::time::interval(interval);
    while !*shutdown.borrow() {
        ticker.tick().await;
        let up = matches!(
            tokio::time::timeout(interval, tokio::net::TcpStream::connect(addr)).await,
            Ok(Ok(_))
        );
        if ready.swap(up, Ordering::Relaxed) != up {
            tracing::info!(port, ready = up, "Dev server readiness changed");
        }
    }
}
