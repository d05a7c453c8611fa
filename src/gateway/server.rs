//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::{Error, Result};

/// How often expired codes and states are swept
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// CRM MCP gateway server
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Create a new gateway
    pub fn new(config: Config) -> Result<Self> {
        let state = Arc::new(AppState::from_config(&config)?);
        info!(
            auth = %state.auth.kind(),
            base_url = %config.upstream.base_url,
            readonly = config.upstream.readonly,
            "Upstream configured"
        );
        Ok(Self { config, state })
    }

    /// Shared state, for embedding the router elsewhere
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Run the gateway until a shutdown signal arrives
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        let public_url = self.config.public_url();
        info!("============================================================");
        info!("CRM MCP GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!("  POST {public_url}/mcp  (JSON-RPC)");
        if self.state.auth.requires_user_authorization() {
            info!("OAUTH (per-user upstream consent):");
            info!("  {public_url}/.well-known/oauth-authorization-server");
            info!("  {public_url}/oauth/start?userKey=<user>");
        } else {
            warn!("No inbound authentication - every client acts as the configured upstream user");
        }
        info!("============================================================");

        let cleanup_state = Arc::clone(&self.state);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let cleanup = tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        cleanup_state.oauth.cleanup();
                        cleanup_state.sessions.cleanup_expired_oauth_states();
                        debug!("Periodic cleanup completed");
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        // In-flight requests get `shutdown_timeout` to drain after the signal.
        let drain_timeout = self.config.server.shutdown_timeout;
        let mut drain_rx = shutdown_tx.subscribe();
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .into_future();
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(
                    timeout_secs = drain_timeout.as_secs(),
                    "Graceful shutdown timed out, dropping open connections"
                );
            }
        }

        cleanup.abort();
        self.shutdown();
        Ok(())
    }

    /// Stop background refresh and close every session
    pub fn shutdown(&self) {
        info!("Shutting down...");
        self.state.auth.shutdown();
        let sessions = self.state.sessions.all_sessions();
        for session in &sessions {
            self.state.sessions.delete_session(&session.id);
        }
        info!(closed_sessions = sessions.len(), "Shutdown complete");
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
