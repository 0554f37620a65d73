mod auth;
mod git;

use anyhow::Result;
use axum::{extract::DefaultBodyLimit, middleware, routing::any, Router};
use cargit_git::GitProtocolServer;
use tokio::net::TcpListener;
use tracing::info;

pub use auth::{AppState, AuthCredentials, Principal};
pub use git::status_for;

/// Largest buffered request body. Only fetch negotiation is buffered;
/// pushes are spooled to disk and have no limit.
const MAX_NEGOTIATION_SIZE: usize = 64 * 1024 * 1024;

pub struct CargitServer {
    state: AppState,
    addr: String,
}

impl CargitServer {
    pub fn new(git: GitProtocolServer, addr: String) -> Self {
        Self {
            state: AppState { git, auth: None },
            addr,
        }
    }

    pub fn with_auth(mut self, username: String, password: String) -> Self {
        self.state.auth = Some(AuthCredentials { username, password });
        self
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/git/:repo/info/refs", any(git::info_refs))
            .route("/git/:repo/git-upload-pack", any(git::upload_pack))
            .route("/git/:repo/git-receive-pack", any(git::receive_pack))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::auth_middleware,
            ))
            .layer(DefaultBodyLimit::max(MAX_NEGOTIATION_SIZE))
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("git smart HTTP listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}
