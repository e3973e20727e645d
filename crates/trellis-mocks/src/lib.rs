//! # trellis-mocks
//!
//! In-process stand-ins for the external services the application-under-test
//! talks to. Each adapter keeps its state in memory and serves the subset of the
//! real service's HTTP surface that scenarios exercise.
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  InferenceMock   │   │    GraphMock     │   │   PinningMock    │
//! │  /v1/models      │   │  /nodes, /edges  │   │  /api/v0/pin/*   │
//! │  /v1/chat/...    │   │  /search, /stats │   │  /api/v0/id      │
//! │  /v1/embeddings  │   │                  │   │                  │
//! └────────┬─────────┘   └────────┬─────────┘   └────────┬─────────┘
//!          └──────────────────────┼──────────────────────┘
//!                           ┌─────▼──────┐
//!                           │ MockServer │  axum + graceful shutdown
//!                           └────────────┘
//! ```
//!
//! Adapters only approximate what a client can observe (request and response
//! shapes, error bodies). They make no attempt at the real services' storage or
//! consistency semantics.

pub mod graph;
pub mod inference;
pub mod pinning;
pub mod server;

pub use graph::{GraphEdge, GraphError, GraphMock, GraphNode, GraphStats, GraphStore, Neighbor};
pub use inference::{
    CannedReply, ChatMessage, Chunk, ChunkSequence, EMBEDDING_DIMENSIONS, InferenceMock,
    InferenceSettings, MODEL_CATALOG, RecordedRequest, embed, select_reply,
};
pub use pinning::{MOCK_PEER_ID, PinError, PinRecord, PinRequest, PinStatus, PinStore, PinningMock};
pub use server::{MockServer, SHUTDOWN_GRACE};

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// The three kinds of external dependency that can be substituted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockKind {
    /// Chat/completion + embeddings backend.
    Inference,
    /// Graph store.
    Graph,
    /// Content-pinning daemon.
    Pinning,
}

impl MockKind {
    /// Returns every adapter kind in start order.
    pub fn all() -> &'static [MockKind] {
        &[MockKind::Inference, MockKind::Graph, MockKind::Pinning]
    }
}

impl fmt::Display for MockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockKind::Inference => write!(f, "inference"),
            MockKind::Graph => write!(f, "graph"),
            MockKind::Pinning => write!(f, "pinning"),
        }
    }
}

/// Errors raised while starting or stopping a mock adapter.
#[derive(Debug, Error)]
pub enum MockError {
    /// The listener could not be bound.
    #[error("{kind} mock failed to bind {addr}: {source}")]
    Bind {
        kind: MockKind,
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// `start` was called on an adapter that is already serving.
    #[error("{0} mock is already running")]
    AlreadyRunning(MockKind),

    /// The server task ended abnormally while shutting down.
    #[error("{kind} mock shut down uncleanly: {message}")]
    Shutdown { kind: MockKind, message: String },
}

/// Lifecycle shared by every adapter.
///
/// State survives `stop`/`start` cycles; only `reset` clears it.
#[async_trait]
pub trait MockAdapter: Send + Sync {
    /// Which dependency this adapter stands in for.
    fn kind(&self) -> MockKind;

    /// Binds the adapter's HTTP surface. Port `0` picks an ephemeral port.
    async fn start(&mut self, bind: SocketAddr) -> Result<SocketAddr, MockError>;

    /// Stops serving. Calling `stop` on a stopped adapter is a no-op.
    async fn stop(&mut self) -> Result<(), MockError>;

    /// Clears all in-memory state.
    fn reset(&self);

    /// Address the adapter is listening on, if started.
    fn local_addr(&self) -> Option<SocketAddr>;
}
