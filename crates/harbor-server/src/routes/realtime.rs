//! Realtime channel endpoints.

use crate::auth::Caller;
use crate::error::ApiResult;
use crate::routes::sessions;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use harbor_core::realtime::{EventPayload, PublishOptions, Subscription};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct PublishQuery {
    /// Rate-limit key within the channel.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishAck {
    pub id: String,
    pub delivered: usize,
    pub dropped: usize,
}

/// `GET /realtime/:channel`, upgraded to a WebSocket streaming every
/// message published on the channel as a JSON text frame.
///
/// Access is checked before the upgrade so a denied subscriber gets a plain
/// `403` response. A session channel is open to the session's creator.
pub async fn subscribe(
    State(state): State<AppState>,
    caller: Caller,
    Path(channel): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let mut subject = caller.0.clone();
    if let Some(session_id) = session_of(&channel) {
        let session = sessions::lookup(&state, &session_id.into()).await?;
        caller.require_session_access(&session)?;
        subject = subject.with_grant(channel.as_str());
    }
    let subscription = state.bus.subscribe(&channel, &subject)?;
    tracing::info!(channel = %channel, subject = %subject.id, "Realtime subscriber connected");
    Ok(ws.on_upgrade(move |socket| pump(socket, subscription, subject.id)))
}

/// Session id named by a `session:{id}` channel.
fn session_of(channel: &str) -> Option<&str> {
    channel
        .strip_prefix("session:")
        .filter(|id| !id.is_empty() && !id.contains(':'))
}

async fn pump(socket: WebSocket, mut subscription: Subscription, subject: String) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { break };
                let text = match serde_json::to_string(message.as_ref()) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode realtime message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::info!(channel = %subscription.channel(), subject = %subject, "Realtime subscriber disconnected");
}

/// `POST /realtime/:channel`
pub async fn publish(
    State(state): State<AppState>,
    caller: Caller,
    Path(channel): Path<String>,
    Query(query): Query<PublishQuery>,
    Json(payload): Json<EventPayload>,
) -> ApiResult<(StatusCode, Json<PublishAck>)> {
    let options = match query.key {
        Some(key) => PublishOptions::key(key),
        None => PublishOptions::default(),
    };
    let receipt = state.bus.publish(&channel, &caller.0, payload, options)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PublishAck {
            id: receipt.id.to_string(),
            delivered: receipt.delivered,
            dropped: receipt.dropped,
        }),
    ))
}
