//! Mock content-pinning daemon (Kubo-flavoured HTTP API).
//!
//! Pins live in a map keyed by a content identifier derived from the request,
//! so pinning the same path, content and metadata twice yields the same `Qm…`
//! identifier within a process. Nothing is persisted or replicated.

use crate::server::MockServer;
use crate::{MockAdapter, MockError, MockKind};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Peer identity reported by `/api/v0/id` and [`PinStore::status`].
pub const MOCK_PEER_ID: &str = "12D3KooWTrellisMockPeer1111111111111111111111111111";

/// Gateway used for `gateway_url` unless overridden.
pub const DEFAULT_GATEWAY: &str = "http://127.0.0.1:8080";

/// Errors returned by pin operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PinError {
    #[error("not pinned or pinned indirectly: {0}")]
    NotPinned(String),

    #[error("invalid path: must not be empty")]
    EmptyPath,
}

impl IntoResponse for PinError {
    fn into_response(self) -> Response {
        let status = match self {
            PinError::NotPinned(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PinError::EmptyPath => StatusCode::BAD_REQUEST,
        };
        let body = json!({ "Message": self.to_string(), "Code": 0, "Type": "error" });
        (status, Json(body)).into_response()
    }
}

/// What to pin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRequest {
    /// Logical path of the content (file name or MFS-style path).
    pub path: String,
    /// Inline content, when the caller has it.
    #[serde(default)]
    pub content: Option<String>,
    /// Free-form metadata; `name` and `size` are honoured when present.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PinRequest {
    /// Request for a path with no inline content or metadata.
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Adds a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets inline content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// A pinned item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub cid: String,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub pinned_at: DateTime<Utc>,
    pub gateway_url: String,
    pub metadata: BTreeMap<String, String>,
}

/// Daemon status summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinStatus {
    pub online: bool,
    pub peer_id: String,
    pub pin_count: usize,
    pub total_size: u64,
}

/// Derives a CIDv0-looking identifier from the request contents.
pub fn derive_cid(request: &PinRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.path.as_bytes());
    hasher.update([0u8]);
    match &request.content {
        Some(content) => {
            hasher.update([1u8]);
            hasher.update(content.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    hasher.update([0u8]);
    for (key, value) in &request.metadata {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("Qm{}", &digest[..44])
}

fn guess_mime_type(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "txt" | "md" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// Shared handle to the pin map. Clones see the same data.
#[derive(Debug, Clone)]
pub struct PinStore {
    pins: Arc<RwLock<BTreeMap<String, PinRecord>>>,
    gateway: String,
}

impl Default for PinStore {
    fn default() -> Self {
        Self::new(DEFAULT_GATEWAY)
    }
}

impl PinStore {
    /// Creates an empty store whose records point at `gateway`.
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            pins: Arc::new(RwLock::new(BTreeMap::new())),
            gateway: gateway.into().trim_end_matches('/').to_string(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PinRecord>> {
        self.pins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PinRecord>> {
        self.pins.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pins content. Re-pinning an identical request returns the existing record.
    pub fn pin(&self, request: PinRequest) -> Result<PinRecord, PinError> {
        if request.path.trim().is_empty() {
            return Err(PinError::EmptyPath);
        }

        let cid = derive_cid(&request);
        let mut pins = self.write();
        if let Some(existing) = pins.get(&cid) {
            return Ok(existing.clone());
        }

        let size = request.content.as_ref().map_or_else(
            || {
                request
                    .metadata
                    .get("size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0)
            },
            |content| content.len() as u64,
        );
        let name = request.metadata.get("name").cloned().unwrap_or_else(|| {
            request
                .path
                .rsplit('/')
                .next()
                .unwrap_or(&request.path)
                .to_string()
        });

        let record = PinRecord {
            gateway_url: format!("{}/ipfs/{}", self.gateway, cid),
            cid: cid.clone(),
            mime_type: guess_mime_type(&request.path).to_string(),
            path: request.path,
            name,
            size,
            pinned_at: Utc::now(),
            metadata: request.metadata,
        };
        pins.insert(cid, record.clone());
        Ok(record)
    }

    /// Removes a pin by identifier.
    pub fn unpin(&self, cid: &str) -> Result<PinRecord, PinError> {
        self.write()
            .remove(cid)
            .ok_or_else(|| PinError::NotPinned(cid.to_string()))
    }

    /// Looks up a pin.
    pub fn get(&self, cid: &str) -> Option<PinRecord> {
        self.read().get(cid).cloned()
    }

    /// All pins in identifier order.
    pub fn list_pins(&self) -> Vec<PinRecord> {
        self.read().values().cloned().collect()
    }

    /// Online flag, fixed peer id and aggregate counts.
    pub fn status(&self) -> PinStatus {
        let pins = self.read();
        PinStatus {
            online: true,
            peer_id: MOCK_PEER_ID.to_string(),
            pin_count: pins.len(),
            total_size: pins.values().map(|p| p.size).sum(),
        }
    }

    /// Drops every pin.
    pub fn reset(&self) {
        self.write().clear();
    }
}

#[derive(Debug, Deserialize)]
struct ArgQuery {
    #[serde(default)]
    arg: String,
}

async fn peer_id() -> Json<Value> {
    Json(json!({
        "ID": MOCK_PEER_ID,
        "AgentVersion": "kubo/0.0.0-trellis-mock",
        "Addresses": [],
    }))
}

async fn pin_add(
    State(store): State<PinStore>,
    Json(request): Json<PinRequest>,
) -> Result<Json<Value>, PinError> {
    let record = store.pin(request)?;
    Ok(Json(json!({ "Pins": [record.cid.clone()], "Record": record })))
}

async fn pin_rm(
    State(store): State<PinStore>,
    Query(query): Query<ArgQuery>,
) -> Result<Json<Value>, PinError> {
    let record = store.unpin(&query.arg)?;
    Ok(Json(json!({ "Pins": [record.cid] })))
}

async fn pin_ls(State(store): State<PinStore>) -> Json<Value> {
    let keys: Map<String, Value> = store
        .list_pins()
        .into_iter()
        .map(|pin| (pin.cid, json!({ "Type": "recursive" })))
        .collect();
    Json(json!({ "Keys": keys }))
}

async fn daemon_status(State(store): State<PinStore>) -> Json<PinStatus> {
    Json(store.status())
}

/// The content-pinning adapter.
#[derive(Debug, Default)]
pub struct PinningMock {
    store: PinStore,
    server: Option<MockServer>,
}

impl PinningMock {
    /// Creates a stopped adapter whose records point at `gateway`.
    pub fn new(gateway: impl Into<String>) -> Self {
        Self {
            store: PinStore::new(gateway),
            server: None,
        }
    }

    /// Handle to the underlying store for in-process use.
    pub fn store(&self) -> PinStore {
        self.store.clone()
    }

    /// Router exposing the HTTP surface.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v0/id", post(peer_id))
            .route("/api/v0/pin/add", post(pin_add))
            .route("/api/v0/pin/rm", post(pin_rm))
            .route("/api/v0/pin/ls", post(pin_ls))
            .route("/status", get(daemon_status))
            .with_state(self.store.clone())
    }

    /// Base URL once started.
    pub fn base_url(&self) -> Option<String> {
        self.server.as_ref().map(MockServer::base_url)
    }
}

#[async_trait]
impl MockAdapter for PinningMock {
    fn kind(&self) -> MockKind {
        MockKind::Pinning
    }

    async fn start(&mut self, bind: SocketAddr) -> Result<SocketAddr, MockError> {
        if self.server.is_some() {
            return Err(MockError::AlreadyRunning(self.kind()));
        }
        let server = MockServer::bind(self.kind(), bind, self.router()).await?;
        let addr = server.local_addr();
        self.server = Some(server);
        Ok(addr)
    }

    async fn stop(&mut self) -> Result<(), MockError> {
        match self.server.take() {
            Some(mut server) => server.shutdown().await,
            None => Ok(()),
        }
    }

    fn reset(&self) {
        self.store.reset();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(MockServer::local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_identical_requests_derive_same_cid() {
        let store = PinStore::default();
        let request = PinRequest::path("docs/readme.md").with_meta("owner", "qa");

        let first = store.pin(request.clone()).unwrap();
        let second = store.pin(request).unwrap();
        assert_eq!(first.cid, second.cid);
        assert_eq!(first.pinned_at, second.pinned_at);
        assert_eq!(store.list_pins().len(), 1);
    }

    #[test]
    fn test_different_metadata_derives_different_cid() {
        let a = derive_cid(&PinRequest::path("a.txt").with_meta("v", "1"));
        let b = derive_cid(&PinRequest::path("a.txt").with_meta("v", "2"));
        assert_ne!(a, b);
        assert!(a.starts_with("Qm"));
        assert_eq!(a.len(), 46);
    }

    #[test]
    fn test_empty_content_differs_from_no_content() {
        let bare = derive_cid(&PinRequest::path("/notes/a.txt"));
        let empty = derive_cid(&PinRequest::path("/notes/a.txt").with_content(""));
        assert_ne!(bare, empty);
        assert_eq!(
            empty,
            derive_cid(&PinRequest::path("/notes/a.txt").with_content(""))
        );
    }

    #[test]
    fn test_unpin_removes_from_list() {
        let store = PinStore::default();
        let kept = store.pin(PinRequest::path("keep.json")).unwrap();
        let removed = store.pin(PinRequest::path("drop.json")).unwrap();

        store.unpin(&removed.cid).unwrap();
        let cids: Vec<String> = store.list_pins().into_iter().map(|p| p.cid).collect();
        assert_eq!(cids, vec![kept.cid]);
        assert_eq!(
            store.unpin(&removed.cid),
            Err(PinError::NotPinned(removed.cid))
        );
    }

    #[test]
    fn test_record_fields() {
        let store = PinStore::new("http://gateway.local/");
        let record = store
            .pin(PinRequest::path("reports/q1.pdf").with_content("%PDF-1.4 stub"))
            .unwrap();

        assert_eq!(record.name, "q1.pdf");
        assert_eq!(record.size, 13);
        assert_eq!(record.mime_type, "application/pdf");
        assert_eq!(
            record.gateway_url,
            format!("http://gateway.local/ipfs/{}", record.cid)
        );
    }

    #[test]
    fn test_size_and_name_from_metadata() {
        let store = PinStore::default();
        let record = store
            .pin(
                PinRequest::path("/mfs/blob")
                    .with_meta("size", "2048")
                    .with_meta("name", "Blob"),
            )
            .unwrap();
        assert_eq!(record.size, 2048);
        assert_eq!(record.name, "Blob");
        assert_eq!(record.mime_type, "application/octet-stream");
    }

    #[test]
    fn test_empty_path_rejected() {
        let store = PinStore::default();
        assert_eq!(store.pin(PinRequest::path("  ")), Err(PinError::EmptyPath));
    }

    #[test]
    fn test_status_aggregates() {
        let store = PinStore::default();
        store.pin(PinRequest::path("a.txt").with_content("abc")).unwrap();
        store.pin(PinRequest::path("b.txt").with_content("de")).unwrap();

        let status = store.status();
        assert!(status.online);
        assert_eq!(status.peer_id, MOCK_PEER_ID);
        assert_eq!(status.pin_count, 2);
        assert_eq!(status.total_size, 5);

        store.reset();
        assert_eq!(store.status().pin_count, 0);
    }

    #[tokio::test]
    async fn test_http_unpin_unknown_uses_kubo_error_shape() {
        let mock = PinningMock::default();
        let response = mock
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v0/pin/rm?arg=QmMissing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["Type"], "error");
        assert!(json["Message"].as_str().unwrap().contains("QmMissing"));
    }

    #[tokio::test]
    async fn test_http_id_reports_peer() {
        let mock = PinningMock::default();
        let response = mock
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v0/id")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ID"], MOCK_PEER_ID);
    }
}
