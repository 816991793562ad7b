//! Realtime subscription to the project's file channel.

use crate::applier::LocalApplier;
use crate::remote::ServiceIdentity;
use anyhow::{bail, Context};
use futures::StreamExt;
use harbor_core::realtime::{
    files_channel, BroadcastMessage, ConnectionState, ReconnectPolicy, Reconnector, ROLES_HEADER,
    USER_HEADER,
};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// WebSocket URL of `channel` under an `http(s)://` API base.
pub fn channel_url(base_url: &str, channel: &str) -> anyhow::Result<String> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        bail!("realtime URL must be http(s): {base_url}");
    };
    Ok(format!("{ws_base}/realtime/{channel}"))
}

/// Subscribes to `project:{id}:files` and applies every event locally.
pub struct RealtimeClient {
    url: String,
    identity: ServiceIdentity,
    policy: ReconnectPolicy,
}

impl RealtimeClient {
    pub fn new(base_url: &str, identity: ServiceIdentity) -> anyhow::Result<Self> {
        let url = channel_url(base_url, &files_channel(&identity.project_id))?;
        Ok(Self {
            url,
            identity,
            policy: ReconnectPolicy::default(),
        })
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run until the reconnect budget is spent.
    pub fn spawn(self, applier: LocalApplier) -> (watch::Receiver<ConnectionState>, JoinHandle<()>) {
        let reconnector = Reconnector::new(self.policy.clone());
        let state = reconnector.watch();
        let task = tokio::spawn(self.run(reconnector, applier));
        (state, task)
    }

    async fn run(self, mut reconnector: Reconnector, mut applier: LocalApplier) {
        loop {
            match self.session(&mut reconnector, &mut applier).await {
                Ok(()) => tracing::info!(url = %self.url, "Realtime connection closed"),
                Err(e) => tracing::warn!(url = %self.url, error = %e, "Realtime connection failed"),
            }

            let (tx, rx) = oneshot::channel();
            if !reconnector.schedule(move || async move {
                let _ = tx.send(());
            }) {
                tracing::error!(url = %self.url, "Realtime disconnected; giving up");
                break;
            }
            if rx.await.is_err() {
                break;
            }
        }
    }

    /// One connection: handshake, then apply messages until the socket ends.
    async fn session(
        &self,
        reconnector: &mut Reconnector,
        applier: &mut LocalApplier,
    ) -> anyhow::Result<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .context("invalid realtime URL")?;
        let headers = request.headers_mut();
        headers.insert(USER_HEADER, HeaderValue::from_str(&self.identity.user_id())?);
        headers.insert(ROLES_HEADER, HeaderValue::from_str(&self.identity.roles())?);
        if let Some(token) = &self.identity.token {
            headers.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {token}"))?,
            );
        }

        let (mut socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .context("realtime handshake failed")?;
        reconnector.mark_connected();
        tracing::info!(url = %self.url, "Realtime connected");

        while let Some(frame) = socket.next().await {
            let text = match frame? {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let message: BroadcastMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(error = %e, "Unparseable realtime frame dropped");
                    continue;
                }
            };
            if message.is_expired(chrono::Utc::now()) {
                continue;
            }
            if let Err(e) = applier.apply(&message).await {
                tracing::warn!(
                    id = %message.id,
                    event = message.event_type(),
                    error = %e,
                    "Failed to apply realtime event"
                );
            }
        }
        Ok(())
    }
}
