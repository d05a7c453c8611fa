//! HTTP router and shared state

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::auth::bearer_middleware;
use super::{mcp, oauth_routes};
use crate::Result;
use crate::auth::{AuthProvider, ProviderSettings};
use crate::config::Config;
use crate::oauth::OAuthServer;
use crate::session::SessionContext;
use crate::tools::CrmTools;
use crate::upstream::UpstreamClient;

/// Shared application state
pub struct AppState {
    /// Inbound sessions and per-user upstream tokens
    pub sessions: Arc<SessionContext>,
    /// Upstream authentication provider
    pub auth: Arc<AuthProvider>,
    /// Upstream CRM client
    pub upstream: Arc<UpstreamClient>,
    /// Tool surface exposed over MCP
    pub tools: CrmTools,
    /// Embedded authorization server (routed only for the code flow)
    pub oauth: OAuthServer,
    /// Upper bound on handling one JSON-RPC request
    pub request_timeout: Duration,
    /// Maximum accepted request body
    pub max_body_size: usize,
}

impl AppState {
    /// Wire the registry, provider, upstream client and tools from `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let sessions = Arc::new(SessionContext::new());
        let public_url = config.public_url();
        let settings = ProviderSettings {
            base_url: config.upstream.base_url.clone(),
            public_url: public_url.clone(),
            timeout: config.upstream.timeout,
            refresh_period: config.refresh.period,
        };
        let auth = Arc::new(AuthProvider::from_config(
            &config.auth_config()?,
            &settings,
            Arc::clone(&sessions),
        )?);
        let upstream = Arc::new(UpstreamClient::new(
            &config.upstream.base_url,
            Arc::clone(&auth),
            config.upstream.timeout,
        )?);

        Ok(Self {
            sessions,
            tools: CrmTools::new(Arc::clone(&upstream), config.upstream.readonly),
            upstream,
            auth,
            oauth: OAuthServer::new(&public_url, config.oauth.clone()),
            request_timeout: config.server.request_timeout,
            max_body_size: config.server.max_body_size,
        })
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mcp = Router::new()
        .route(
            "/mcp",
            post(mcp::handle_post)
                .get(mcp::handle_get)
                .delete(mcp::handle_delete),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            bearer_middleware,
        ));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(mcp);

    if state.auth.requires_user_authorization() {
        router = router.merge(oauth_routes::routes());
    }

    router
        .layer(DefaultBodyLimit::max(state.max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Liveness plus registry counters
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let oauth = state
        .auth
        .requires_user_authorization()
        .then(|| state.oauth.stats());

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "auth": state.auth.kind().as_str(),
            "sessions": state.sessions.stats(),
            "refresh": state.auth.refresh_stats(),
            "oauth": oauth,
        })),
    )
}

