use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;
use crate::state::ServerState;

/// In-memory object server.
pub struct SpeckleServer {
    config: ServerConfig,
    state: Arc<ServerState>,
}

impl SpeckleServer {
    pub fn new(config: ServerConfig) -> Self {
        let state = Arc::new(ServerState::new(config.clone()));
        Self { config, state }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared state, for inspecting what clients stored.
    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(self.state.clone())
    }

    /// Serve on the configured address until the process stops.
    pub async fn serve(self) -> ServerResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        tracing::info!("object server listening on {}", self.config.bind_addr);
        axum::serve(listener, self.router())
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }

    /// Bind and serve in a background task. Port 0 picks a free port; the
    /// bound address is returned.
    pub async fn spawn(self) -> ServerResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        tracing::info!("object server listening on {addr}");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "object server stopped");
            }
        });
        Ok((addr, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_construction() {
        let server = SpeckleServer::new(ServerConfig::default());
        assert_eq!(server.config().bind_addr, "127.0.0.1:3000".parse().unwrap());
        assert_eq!(server.state().stored_objects(), 0);
    }

    #[tokio::test]
    async fn spawn_on_free_port() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        let (addr, handle) = SpeckleServer::new(config).spawn().await.unwrap();
        assert_ne!(addr.port(), 0);
        handle.abort();
    }
}
