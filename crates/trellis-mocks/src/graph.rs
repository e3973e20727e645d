//! Mock graph store.
//!
//! An in-memory map of nodes keyed by identifier plus a flat edge list. There is
//! no query language: every operation is a direct structural manipulation whose
//! result is shaped like what a Neo4j driver hands back (`labels`,
//! `properties`, relationship `type`). Errors use Neo4j's
//! `{"errors":[{"code","message"}]}` envelope.

use crate::server::MockServer;
use crate::{MockAdapter, MockError, MockKind};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Label given to nodes upserted without a `category` or `type` field.
pub const DEFAULT_CATEGORY: &str = "Entity";

const DEFAULT_LIMIT: usize = 25;
const MAX_LIMIT: usize = 1000;

/// Errors returned by graph operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("invalid node payload: {0}")]
    InvalidPayload(String),
}

impl GraphError {
    /// Neo4j status code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::NodeNotFound(_) => "Neo.ClientError.Statement.EntityNotFound",
            GraphError::InvalidPayload(_) => "Neo.ClientError.Statement.TypeError",
        }
    }
}

impl IntoResponse for GraphError {
    fn into_response(self) -> Response {
        let status = match self {
            GraphError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            GraphError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        };
        let body = json!({ "errors": [{ "code": self.code(), "message": self.to_string() }] });
        (status, Json(body)).into_response()
    }
}

/// A stored node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub labels: Vec<String>,
    pub properties: Map<String, Value>,
}

impl GraphNode {
    /// The node's category (its first label).
    pub fn category(&self) -> &str {
        self.labels
            .first()
            .map_or(DEFAULT_CATEGORY, String::as_str)
    }

    fn matches(&self, needle: &str) -> bool {
        self.id.to_lowercase().contains(needle)
            || self.properties.values().any(|value| {
                value
                    .as_str()
                    .is_some_and(|s| s.to_lowercase().contains(needle))
            })
    }
}

/// A typed, directed relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub label: String,
}

/// Which end of the relationship the neighbor sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// A node adjacent to the queried one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub node: GraphNode,
    pub relationship: String,
    pub direction: Direction,
}

/// Aggregate counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub relationships: usize,
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: BTreeMap<String, GraphNode>,
    edges: Vec<GraphEdge>,
}

/// Shared handle to the in-memory graph. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    inner: Arc<RwLock<GraphState>>,
}

impl GraphStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates or updates a node, merging `data` into existing properties.
    ///
    /// `data` must be a JSON object (or `null`). A `category` or `type`
    /// field becomes the node's label; an existing label is kept otherwise.
    pub fn upsert(&self, id: &str, data: Value) -> Result<GraphNode, GraphError> {
        let mut props = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(GraphError::InvalidPayload(format!(
                    "expected an object, got {}",
                    other
                )));
            }
        };
        props.remove("id");

        let category = props
            .get("category")
            .or_else(|| props.get("type"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut state = self.write();
        let node = state
            .nodes
            .entry(id.to_string())
            .or_insert_with(|| GraphNode {
                id: id.to_string(),
                labels: vec![DEFAULT_CATEGORY.to_string()],
                properties: Map::new(),
            });

        if let Some(category) = category {
            node.labels = vec![category];
        }
        node.properties.extend(props);
        Ok(node.clone())
    }

    /// Removes a node and every relationship touching it.
    pub fn delete(&self, id: &str) -> Result<(), GraphError> {
        let mut state = self.write();
        if state.nodes.remove(id).is_none() {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }
        state.edges.retain(|edge| edge.from != id && edge.to != id);
        Ok(())
    }

    /// Point lookup.
    pub fn get(&self, id: &str) -> Result<GraphNode, GraphError> {
        self.read()
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    /// Up to `limit` nodes in identifier order.
    pub fn list(&self, limit: usize) -> Vec<GraphNode> {
        self.read().nodes.values().take(limit).cloned().collect()
    }

    /// Nodes whose id or any string property contains `term` (case-insensitive).
    pub fn search(&self, term: &str, limit: usize) -> Vec<GraphNode> {
        let needle = term.to_lowercase();
        self.read()
            .nodes
            .values()
            .filter(|node| node.matches(&needle))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Nodes connected to `id` by a recorded edge, in either direction.
    pub fn neighbors(&self, id: &str) -> Result<Vec<Neighbor>, GraphError> {
        let state = self.read();
        if !state.nodes.contains_key(id) {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }

        let neighbors = state
            .edges
            .iter()
            .filter_map(|edge| {
                let (other, direction) = if edge.from == id {
                    (&edge.to, Direction::Outgoing)
                } else if edge.to == id {
                    (&edge.from, Direction::Incoming)
                } else {
                    return None;
                };
                state.nodes.get(other).map(|node| Neighbor {
                    node: node.clone(),
                    relationship: edge.label.clone(),
                    direction,
                })
            })
            .collect();
        Ok(neighbors)
    }

    /// Records a relationship. Both endpoints must exist; duplicates collapse.
    pub fn link(&self, from: &str, to: &str, label: &str) -> Result<GraphEdge, GraphError> {
        let mut state = self.write();
        for id in [from, to] {
            if !state.nodes.contains_key(id) {
                return Err(GraphError::NodeNotFound(id.to_string()));
            }
        }

        let edge = GraphEdge {
            from: from.to_string(),
            to: to.to_string(),
            label: label.to_string(),
        };
        if !state.edges.contains(&edge) {
            state.edges.push(edge.clone());
        }
        Ok(edge)
    }

    /// Node/relationship totals and node counts per category.
    pub fn stats(&self) -> GraphStats {
        let state = self.read();
        let mut by_category = BTreeMap::new();
        for node in state.nodes.values() {
            *by_category.entry(node.category().to_string()).or_insert(0) += 1;
        }
        GraphStats {
            nodes: state.nodes.len(),
            relationships: state.edges.len(),
            by_category,
        }
    }

    /// Drops every node and edge.
    pub fn reset(&self) {
        let mut state = self.write();
        state.nodes.clear();
        state.edges.clear();
    }
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LinkRequest {
    from: String,
    to: String,
    #[serde(rename = "type")]
    label: String,
}

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

async fn discovery() -> Json<Value> {
    Json(json!({
        "neo4j_version": "5.15.0-mock",
        "neo4j_edition": "community",
    }))
}

async fn list_nodes(State(store): State<GraphStore>, Query(query): Query<LimitQuery>) -> Json<Value> {
    Json(json!({ "nodes": store.list(clamp_limit(query.limit)) }))
}

async fn upsert_node(
    State(store): State<GraphStore>,
    Path(id): Path<String>,
    Json(data): Json<Value>,
) -> Result<Json<GraphNode>, GraphError> {
    store.upsert(&id, data).map(Json)
}

async fn get_node(
    State(store): State<GraphStore>,
    Path(id): Path<String>,
) -> Result<Json<GraphNode>, GraphError> {
    store.get(&id).map(Json)
}

async fn delete_node(
    State(store): State<GraphStore>,
    Path(id): Path<String>,
) -> Result<StatusCode, GraphError> {
    store.delete(&id).map(|()| StatusCode::NO_CONTENT)
}

async fn node_neighbors(
    State(store): State<GraphStore>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GraphError> {
    store
        .neighbors(&id)
        .map(|neighbors| Json(json!({ "neighbors": neighbors })))
}

async fn create_edge(
    State(store): State<GraphStore>,
    Json(request): Json<LinkRequest>,
) -> Result<(StatusCode, Json<GraphEdge>), GraphError> {
    store
        .link(&request.from, &request.to, &request.label)
        .map(|edge| (StatusCode::CREATED, Json(edge)))
}

async fn search_nodes(
    State(store): State<GraphStore>,
    Query(query): Query<SearchQuery>,
) -> Json<Value> {
    Json(json!({ "nodes": store.search(&query.q, clamp_limit(query.limit)) }))
}

async fn graph_stats(State(store): State<GraphStore>) -> Json<GraphStats> {
    Json(store.stats())
}

async fn reset_graph(State(store): State<GraphStore>) -> StatusCode {
    store.reset();
    StatusCode::NO_CONTENT
}

/// The graph adapter.
#[derive(Debug, Default)]
pub struct GraphMock {
    store: GraphStore,
    server: Option<MockServer>,
}

impl GraphMock {
    /// Creates a stopped adapter with an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the underlying store for in-process use.
    pub fn store(&self) -> GraphStore {
        self.store.clone()
    }

    /// Router exposing the HTTP surface.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(discovery))
            .route("/nodes", get(list_nodes))
            .route(
                "/nodes/{id}",
                get(get_node).put(upsert_node).delete(delete_node),
            )
            .route("/nodes/{id}/neighbors", get(node_neighbors))
            .route("/edges", post(create_edge))
            .route("/search", get(search_nodes))
            .route("/stats", get(graph_stats))
            .route("/reset", post(reset_graph))
            .with_state(self.store.clone())
    }

    /// Base URL once started.
    pub fn base_url(&self) -> Option<String> {
        self.server.as_ref().map(MockServer::base_url)
    }
}

#[async_trait]
impl MockAdapter for GraphMock {
    fn kind(&self) -> MockKind {
        MockKind::Graph
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
