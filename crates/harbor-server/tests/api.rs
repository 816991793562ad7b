//! End-to-end API tests against the in-memory stack and a fake compute API.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use harbor_core::files::FileKind;
use harbor_core::realtime::{RateLimitConfig, ROLES_HEADER, USER_HEADER};
use harbor_core::RegistryConfig;
use harbor_machine::{FakeMachineApi, MachineError};
use harbor_server::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tower::ServiceExt;

fn state_with(api: Arc<FakeMachineApi>, per_minute: u32) -> AppState {
    let config = RegistryConfig::builder()
        .preview_domain("preview.example.com")
        .build()
        .unwrap();
    AppState::with_machine_api(
        api,
        config,
        RateLimitConfig::new(per_minute, Duration::from_secs(60)),
    )
}

fn app() -> (Router, Arc<FakeMachineApi>) {
    let api = Arc::new(FakeMachineApi::new());
    (build_router(state_with(api.clone(), 1000)), api)
}

fn request(method: Method, uri: &str, caller: Option<(&str, &str)>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((user, roles)) = caller {
        builder = builder.header(USER_HEADER, user).header(ROLES_HEADER, roles);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

const OWNER: Option<(&str, &str)> = Some(("U1", "P1:owner"));

#[tokio::test]
async fn test_session_lifecycle() {
    let (app, api) = app();

    let (status, session) = send(
        &app,
        request(Method::POST, "/sessions", OWNER, Some(json!({ "projectId": "P1", "tier": "free" }))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "active");
    let id = session["sessionId"].as_str().unwrap().to_string();
    assert_eq!(
        session["containerUrl"],
        format!("https://{id}-3000.preview.example.com")
    );

    let (status, fetched) = send(&app, request(Method::GET, &format!("/sessions/{id}"), OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["sessionId"], id.as_str());

    let (status, listed) = send(&app, request(Method::GET, "/users/U1/sessions", OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, destroyed) =
        send(&app, request(Method::DELETE, &format!("/sessions/{id}"), OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(destroyed["status"], "terminated");

    let (status, again) =
        send(&app, request(Method::DELETE, &format!("/sessions/{id}"), OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["status"], "terminated");
    assert_eq!(api.call_count("delete"), 1);
}

#[tokio::test]
async fn test_session_requires_project_role() {
    let (app, api) = app();

    let (status, body) = send(
        &app,
        request(Method::POST, "/sessions", Some(("U1", "P1:viewer")), Some(json!({ "projectId": "P1" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "access_denied");

    let (status, _) = send(&app, request(Method::POST, "/sessions", None, Some(json!({ "projectId": "P1" })))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(api.call_count("create"), 0);
}

#[tokio::test]
async fn test_other_users_sessions_hidden() {
    let (app, _) = app();
    let (status, _) = send(&app, request(Method::GET, "/users/U2/sessions", OWNER, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let (app, _) = app();
    let (status, body) = send(&app, request(Method::DELETE, "/sessions/nope", OWNER, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn test_provisioning_failure_is_bad_gateway() {
    let (app, api) = app();
    api.fail_next("create", MachineError::from_status(422, "invalid image"));

    let (status, body) = send(
        &app,
        request(Method::POST, "/sessions", OWNER, Some(json!({ "projectId": "P1" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let id = body["sessionId"].as_str().unwrap().to_string();

    let (_, session) = send(&app, request(Method::GET, &format!("/sessions/{id}"), OWNER, None)).await;
    assert_eq!(session["status"], "error");
    assert!(session["errorMessage"].is_string());
}

#[tokio::test]
async fn test_file_versions_and_conflict() {
    let (app, _) = app();
    let uri = "/projects/P1/files?path=src/a.ts";

    let (status, created) = send(&app, request(Method::PUT, uri, OWNER, Some(json!({ "content": "v1" })))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["version"], 1);

    let (status, updated) = send(
        &app,
        request(Method::PUT, uri, OWNER, Some(json!({ "content": "v2", "expectedVersion": 1 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["version"], 2);

    let (status, conflict) = send(
        &app,
        request(Method::PUT, uri, OWNER, Some(json!({ "content": "v3", "expectedVersion": 1 }))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["currentVersion"], 2);

    let (status, record) = send(&app, request(Method::GET, uri, Some(("U2", "P1:viewer")), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["content"], "v2");
    assert_eq!(record["type"], "file");
}

#[tokio::test]
async fn test_viewer_cannot_write() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        request(
            Method::PUT,
            "/projects/P1/files?path=a.ts",
            Some(("U2", "P1:viewer")),
            Some(json!({ "content": "x" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_deleted_file_hidden_but_auditable() {
    let (app, _) = app();
    let uri = "/projects/P1/files?path=old.css";
    send(&app, request(Method::PUT, uri, OWNER, Some(json!({ "content": "body{}" })))).await;

    let (status, deleted) = send(
        &app,
        request(Method::DELETE, "/projects/P1/files?path=old.css&expectedVersion=1", OWNER, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(deleted["version"], 2);

    let (status, _) = send(&app, request(Method::GET, uri, OWNER, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, tombstone) = send(
        &app,
        request(Method::GET, "/projects/P1/files?path=old.css&includeDeleted=true", OWNER, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(tombstone["content"].is_null());

    let (_, listed) = send(&app, request(Method::GET, "/projects/P1/files/all", OWNER, None)).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_rejected_bulk_is_conflict() {
    let (app, _) = app();
    send(
        &app,
        request(Method::PUT, "/projects/P1/files?path=a.ts", OWNER, Some(json!({ "content": "v1" }))),
    )
    .await;

    let (status, result) = send(
        &app,
        request(
            Method::POST,
            "/projects/P1/files/bulk",
            OWNER,
            Some(json!({ "files": [
                { "path": "a.ts", "action": "update", "content": "v2", "expectedVersion": 5 },
                { "path": "b.ts", "action": "update", "content": "new" }
            ]})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(result["applied"], false);
    assert_eq!(result["upserted"], 0);

    let (status, _) = send(&app, request(Method::GET, "/projects/P1/files?path=b.ts", OWNER, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_snapshot_round_trip_between_projects() {
    let (app, _) = app();
    let caller = Some(("U1", "P1:owner,P2:owner"));
    send(
        &app,
        request(Method::PUT, "/projects/P1/files?path=index.html", caller, Some(json!({ "content": "<html/>" }))),
    )
    .await;

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/projects/P1/snapshot", caller, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/gzip");
    let archive = to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let import = Request::builder()
        .method(Method::POST)
        .uri("/projects/P2/snapshot")
        .header(USER_HEADER, "U1")
        .header(ROLES_HEADER, "P1:owner,P2:owner")
        .body(Body::from(archive))
        .unwrap();
    let (status, result) = send(&app, import).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["applied"], true);

    let (_, record) = send(&app, request(Method::GET, "/projects/P2/files?path=index.html", caller, None)).await;
    assert_eq!(record["content"], "<html/>");
}

#[tokio::test]
async fn test_api_rate_limit_spares_health() {
    let api = Arc::new(FakeMachineApi::new());
    let app = build_router(state_with(api, 2));

    for _ in 0..2 {
        let (status, _) = send(&app, request(Method::GET, "/projects/P1/files/all", OWNER, None)).await;
        assert_eq!(status, StatusCode::OK);
    }
    let response = app
        .clone()
        .oneshot(request(Method::GET, "/projects/P1/files/all", OWNER, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let (status, health) = send(&app, request(Method::GET, "/health", OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_publish_requires_role() {
    let (app, _) = app();
    let event = json!({
        "event": "hot_reload",
        "payload": { "projectId": "P1", "changedFiles": ["src/a.ts"], "timestamp": chrono::Utc::now() }
    });

    let (status, _) = send(
        &app,
        request(Method::POST, "/realtime/project:P1:reload", Some(("U2", "P1:viewer")), Some(event.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, ack) = send(
        &app,
        request(Method::POST, "/realtime/project:P1:reload", Some(("agent-s1", "P1:service")), Some(event)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(ack["delivered"], 0);

    let (status, _) = send(
        &app,
        request(Method::POST, "/realtime/unknown", OWNER, Some(json!({
            "event": "hot_reload",
            "payload": { "projectId": "P1", "changedFiles": [], "timestamp": chrono::Utc::now() }
        }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_websocket_receives_file_updates() {
    let state = state_with(Arc::new(FakeMachineApi::new()), 1000);
    let files = state.files.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, build_router(state)).await.unwrap() });

    let mut ws_request = format!("ws://{addr}/realtime/project:P1:files")
        .into_client_request()
        .unwrap();
    ws_request
        .headers_mut()
        .insert(USER_HEADER, HeaderValue::from_static("agent-s1"));
    ws_request
        .headers_mut()
        .insert(ROLES_HEADER, HeaderValue::from_static("P1:service"));
    let (mut socket, _) = tokio_tungstenite::connect_async(ws_request).await.unwrap();

    // The subscription is registered before the upgrade completes.
    files
        .upsert("P1", "src/app.ts", "export {}", FileKind::File, None)
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(message["event"], "file:update");
    assert_eq!(message["payload"]["filePath"], "src/app.ts");
    assert_eq!(message["payload"]["version"], 1);
}

#[tokio::test]
async fn test_session_visible_to_creator_and_service_only() {
    let (app, _) = app();
    let (_, session) = send(
        &app,
        request(Method::POST, "/sessions", OWNER, Some(json!({ "projectId": "P1" }))),
    )
    .await;
    let uri = format!("/sessions/{}", session["sessionId"].as_str().unwrap());
    assert_eq!(session["userId"], "U1");

    let (status, _) = send(&app, request(Method::GET, &uri, Some(("U2", "P1:owner")), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request(Method::GET, &uri, Some(("agent-s1", "P1:service")), None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_session_channel_subscription_requires_creator() {
    let state = state_with(Arc::new(FakeMachineApi::new()), 1000);
    let registry = state.registry.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, build_router(state)).await.unwrap() });

    let session = registry
        .create_session(harbor_core::CreateSessionRequest {
            project_id: "P1".into(),
            user_id: "U1".into(),
            device_type: "desktop".into(),
            tier: None,
        })
        .await
        .unwrap();

    let connect = |user: &'static str, roles: &'static str| {
        let mut ws_request = format!("ws://{addr}/realtime/session:{}", session.session_id)
            .into_client_request()
            .unwrap();
        ws_request
            .headers_mut()
            .insert(USER_HEADER, HeaderValue::from_static(user));
        ws_request
            .headers_mut()
            .insert(ROLES_HEADER, HeaderValue::from_static(roles));
        tokio_tungstenite::connect_async(ws_request)
    };

    assert!(connect("U2", "P1:owner").await.is_err());
    let (mut socket, _) = connect("U1", "P1:editor").await.unwrap();

    registry.destroy_session(&session.session_id).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let message: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(message["event"], "session:status");
    assert_eq!(message["payload"]["status"], "terminating");
}
