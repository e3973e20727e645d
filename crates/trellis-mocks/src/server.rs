//! Shared HTTP plumbing for the mock adapters.

use crate::{MockError, MockKind};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// How long [`MockServer::shutdown`] waits for in-flight connections.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running axum server bound to a local address.
///
/// Dropping the handle without calling [`MockServer::shutdown`] aborts the
/// server task.
#[derive(Debug)]
pub struct MockServer {
    kind: MockKind,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Binds `addr` and starts serving `router` on a background task.
    pub async fn bind(kind: MockKind, addr: SocketAddr, router: Router) -> Result<Self, MockError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MockError::Bind { kind, addr, source })?;
        let local = listener
            .local_addr()
            .map_err(|source| MockError::Bind { kind, addr, source })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::warn!("{} mock server error: {}", kind, e);
            }
        });

        tracing::info!("{} mock listening on {}", kind, local);

        Ok(Self {
            kind,
            addr: local,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// The bound address (with the real port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://` base URL for the bound address.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Signals graceful shutdown and waits up to [`SHUTDOWN_GRACE`] for the
    /// server task to finish.
    pub async fn shutdown(&mut self) -> Result<(), MockError> {
        self.shutdown_within(SHUTDOWN_GRACE).await
    }

    /// Signals graceful shutdown and waits up to `grace` for open connections
    /// to drain. A server still busy after `grace` is aborted and reported.
    pub async fn shutdown_within(&mut self, grace: Duration) -> Result<(), MockError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => {
                joined.map_err(|e| MockError::Shutdown {
                    kind: self.kind,
                    message: e.to_string(),
                })?;
                tracing::info!("{} mock on {} stopped", self.kind, self.addr);
                Ok(())
            }
            Err(_) => {
                task.abort();
                tracing::warn!("{} mock on {} aborted after {:?}", self.kind, self.addr, grace);
                Err(MockError::Shutdown {
                    kind: self.kind,
                    message: format!("connections still open after {grace:?}"),
                })
            }
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_bind_ephemeral_port_and_shutdown() {
        let router = Router::new().route("/", get(|| async { "ok" }));
        let mut server = MockServer::bind(
            MockKind::Graph,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            router,
        )
        .await
        .unwrap();

        assert_ne!(server.local_addr().port(), 0);
        assert!(server.base_url().starts_with("http://127.0.0.1:"));

        let body = reqwest::get(server.base_url()).await.unwrap().text().await.unwrap();
        assert_eq!(body, "ok");

        server.shutdown().await.unwrap();
        // Second shutdown is a no-op.
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_aborts_server_with_stuck_request() {
        let router = Router::new().route(
            "/stuck",
            get(|| async {
                std::future::pending::<()>().await;
                "never"
            }),
        );
        let mut server = MockServer::bind(
            MockKind::Inference,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            router,
        )
        .await
        .unwrap();

        let url = format!("{}/stuck", server.base_url());
        let request = tokio::spawn(async move { reqwest::get(url).await });
        // Let the request reach the handler before shutting down.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = server
            .shutdown_within(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MockError::Shutdown { kind: MockKind::Inference, .. }));
        // Already aborted; nothing left to wait for.
        server.shutdown().await.unwrap();
        request.abort();
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_kind() {
        let first = MockServer::bind(
            MockKind::Pinning,
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Router::new(),
        )
        .await
        .unwrap();

        let err = MockServer::bind(MockKind::Pinning, first.local_addr(), Router::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MockError::Bind { kind: MockKind::Pinning, .. }));
    }
}
