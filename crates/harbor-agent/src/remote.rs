//! HTTP collaborators: object storage, the versioned file API and reload
//! publishing through the Harbor API.

use async_trait::async_trait;
use harbor_core::files::{FileRecord, ObjectStorage, RecordSource};
use harbor_core::realtime::{
    reload_channel, EventPayload, HotReload, RebuildTrigger, ReloadPublisher, ROLES_HEADER,
    USER_HEADER,
};
use harbor_core::{CoreError, Result};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| CoreError::Store(format!("failed to build HTTP client: {e}")))
}

fn store_err(context: &str) -> impl Fn(reqwest::Error) -> CoreError + '_ {
    move |e| CoreError::Store(format!("{context}: {e}"))
}

/// Identity presented to the Harbor API.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub session_id: String,
    pub project_id: String,
    pub token: Option<String>,
}

impl ServiceIdentity {
    pub fn user_id(&self) -> String {
        format!("agent-{}", self.session_id)
    }

    pub fn roles(&self) -> String {
        format!("{}:service", self.project_id)
    }

    fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder
            .header(USER_HEADER, self.user_id())
            .header(ROLES_HEADER, self.roles());
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Object storage gateway.
///
/// `GET {base}/list?prefix=...` returns a JSON array of keys and
/// `GET {base}/objects/{key}` returns the object's bytes.
pub struct HttpObjectStorage {
    base_url: String,
    http: reqwest::Client,
}

impl HttpObjectStorage {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            http: client()?,
        })
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.http
            .get(format!("{}/list", self.base_url))
            .query(&[("prefix", prefix)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(store_err("storage list"))?
            .json()
            .await
            .map_err(store_err("storage list body"))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let bytes = self
            .http
            .get(format!("{}/objects/{key}", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(store_err("storage download"))?
            .bytes()
            .await
            .map_err(store_err("storage download body"))?;
        Ok(bytes.to_vec())
    }
}

/// Reads current records from `GET {base}/projects/{id}/files/all`.
pub struct HttpRecordSource {
    base_url: String,
    identity: ServiceIdentity,
    http: reqwest::Client,
}

impl HttpRecordSource {
    pub fn new(base_url: impl Into<String>, identity: ServiceIdentity) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            identity,
            http: client()?,
        })
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn current_records(&self, project_id: &str) -> Result<Vec<FileRecord>> {
        let request = self
            .http
            .get(format!("{}/projects/{project_id}/files/all", self.base_url));
        self.identity
            .apply(request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(store_err("file records"))?
            .json()
            .await
            .map_err(store_err("file records body"))
    }
}

/// Publishes `hot_reload` through `POST {base}/realtime/{channel}`.
pub struct HttpReloadPublisher {
    base_url: String,
    identity: ServiceIdentity,
    http: reqwest::Client,
}

impl HttpReloadPublisher {
    pub fn new(base_url: impl Into<String>, identity: ServiceIdentity) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            identity,
            http: client()?,
        })
    }
}

#[async_trait]
impl ReloadPublisher for HttpReloadPublisher {
    async fn publish_reload(&self, event: HotReload) -> Result<()> {
        let channel = reload_channel(&event.project_id);
        let request = self
            .http
            .post(format!("{}/realtime/{channel}", self.base_url))
            .json(&EventPayload::HotReload(event));
        let response = self
            .identity
            .apply(request)
            .send()
            .await
            .map_err(|e| CoreError::ChannelClosed(format!("reload publish: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .map_or(Duration::from_secs(1), Duration::from_secs);
            return Err(CoreError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(CoreError::ChannelClosed(format!(
                "reload publish rejected with {status}"
            )));
        }
        Ok(())
    }
}

/// Reload publisher used when no Harbor API is configured.
pub struct LogReloadPublisher;

#[async_trait]
impl ReloadPublisher for LogReloadPublisher {
    async fn publish_reload(&self, event: HotReload) -> Result<()> {
        tracing::info!(project_id = %event.project_id, files = ?event.changed_files, "Hot reload (not published)");
        Ok(())
    }
}

/// Asks an HTTP endpoint to rebuild: `POST {url}` with `{"changedFiles": [...]}`.
pub struct HttpRebuildTrigger {
    url: String,
    http: reqwest::Client,
}

impl HttpRebuildTrigger {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: url.into(),
            http: client()?,
        })
    }
}

#[async_trait]
impl RebuildTrigger for HttpRebuildTrigger {
    async fn rebuild(&self, changed_files: &[String]) -> Result<()> {
        self.http
            .post(&self.url)
            .json(&serde_json::json!({ "changedFiles": changed_files }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(store_err("rebuild request"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use harbor_core::files::storage_prefix;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn identity() -> ServiceIdentity {
        ServiceIdentity {
            session_id: "s1".into(),
            project_id: "P1".into(),
            token: None,
        }
    }

    #[tokio::test]
    async fn test_storage_list_and_download() {
        let app = Router::new()
            .route(
                "/list",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    let prefix = q.get("prefix").cloned().unwrap_or_default();
                    Json(vec![format!("{prefix}index.html")])
                }),
            )
            .route(
                "/objects/*key",
                get(|Path(key): Path<String>| async move { format!("body of {key}") }),
            );
        let storage = HttpObjectStorage::new(serve(app).await).unwrap();

        let keys = storage.list(&storage_prefix("P1")).await.unwrap();
        assert_eq!(keys, vec!["projects/P1/files/index.html"]);
        let body = storage.download(&keys[0]).await.unwrap();
        assert_eq!(body, b"body of projects/P1/files/index.html");
    }

    #[tokio::test]
    async fn test_reload_publisher_sends_identity() {
        let seen: Arc<Mutex<Vec<(String, String, serde_json::Value)>>> = Arc::default();
        let recorder = seen.clone();
        let app = Router::new().route(
            "/realtime/:channel",
            post(
                move |Path(channel): Path<String>, headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                    let recorder = recorder.clone();
                    async move {
                        let user = headers
                            .get(USER_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        recorder.lock().unwrap().push((channel, user, body));
                        axum::http::StatusCode::ACCEPTED
                    }
                },
            ),
        );
        let publisher = HttpReloadPublisher::new(serve(app).await, identity()).unwrap();

        publisher
            .publish_reload(HotReload {
                project_id: "P1".into(),
                changed_files: vec!["src/a.ts".into()],
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].0, "project:P1:reload");
        assert_eq!(seen[0].1, "agent-s1");
        assert_eq!(seen[0].2["event"], "hot_reload");
    }

    #[tokio::test]
    async fn test_reload_publisher_maps_rate_limit() {
        let app = Router::new().route(
            "/realtime/:channel",
            post(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    [(axum::http::header::RETRY_AFTER, "7")],
                )
            }),
        );
        let publisher = HttpReloadPublisher::new(serve(app).await, identity()).unwrap();
        let err = publisher
            .publish_reload(HotReload {
                project_id: "P1".into(),
                changed_files: vec![],
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::RateLimited { retry_after } if retry_after == Duration::from_secs(7)
        ));
    }
}
