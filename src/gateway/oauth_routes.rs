//! Authorization server and upstream consent endpoints

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{FromRequest, Query, State},
    http::{Request, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::{Url, form_urlencoded};

use super::router::AppState;
use crate::context::{self, RequestContext};
use crate::oauth::bridge::{self, BridgeParams};
use crate::oauth::pkce::METHOD_S256;
use crate::oauth::{AuthorizationRequest, OAuthError, TokenRequest, pages, validators};

/// Routes mounted for the authorization-code provider
pub(super) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/.well-known/oauth-authorization-server", get(metadata))
        .route("/register", post(register))
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        .route("/oauth/revoke", post(oauth_revoke))
}

fn oauth_error(status: StatusCode, err: OAuthError) -> Response {
    (status, Json(err)).into_response()
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn error_html(status: StatusCode, error: &str, description: &str) -> Response {
    (status, Html(pages::error_page(error, description))).into_response()
}

/// `uri` with extra query pairs; `None` when `uri` is not absolute
fn with_query(uri: &str, pairs: &[(&str, &str)]) -> Option<String> {
    let mut url = Url::parse(uri).ok()?;
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in pairs {
            query.append_pair(k, v);
        }
    }
    Some(url.into())
}

/// Last four characters, for logging codes and tokens
fn tail(secret: &str) -> String {
    let start = secret.len().saturating_sub(4);
    match secret.get(start..) {
        Some(t) => format!("***{t}"),
        None => "***".to_string(),
    }
}

async fn metadata(State(state): State<Arc<AppState>>) -> Response {
    Json(state.oauth.metadata()).into_response()
}

async fn register(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Response {
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match validators::validate_client_registration(request.get("redirect_uris")) {
        Ok(redirect_uris) => {
            let client = state.oauth.register_client(redirect_uris);
            (StatusCode::CREATED, Json(client)).into_response()
        }
        Err(description) => {
            warn!(error = %description, "Client registration rejected");
            oauth_error(StatusCode::BAD_REQUEST, OAuthError::invalid_request(description))
        }
    }
}

async fn authorize(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuthorizationRequest>,
) -> Response {
    if let Err(err) = state.oauth.validate_authorization_request(&params) {
        warn!(client_id = %params.client_id, error = %err, "Authorization request rejected");
        // Errors are only redirected to a URI registered for this client.
        if !state
            .oauth
            .is_registered_redirect(&params.client_id, &params.redirect_uri)
        {
            return oauth_error(StatusCode::BAD_REQUEST, err);
        }
        let mut pairs = vec![("error", err.error.as_str())];
        if let Some(desc) = err.error_description.as_deref() {
            pairs.push(("error_description", desc));
        }
        if let Some(s) = params.state.as_deref().filter(|s| !s.is_empty()) {
            pairs.push(("state", s));
        }
        return match with_query(&params.redirect_uri, &pairs) {
            Some(url) => found(&url),
            None => oauth_error(StatusCode::BAD_REQUEST, err),
        };
    }

    let client_state = params.state.as_deref().unwrap_or_default();
    if !client_state.is_empty() {
        state.oauth.store_state(client_state, &params.client_id);
    }

    let auth_key = uuid::Uuid::new_v4().to_string();
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("authKey", &auth_key)
        .append_pair("client_id", &params.client_id)
        .append_pair("redirect_uri", &params.redirect_uri)
        .append_pair("code_challenge", &params.code_challenge)
        .append_pair("code_challenge_method", &params.code_challenge_method)
        .append_pair("state", client_state)
        .finish();
    info!(client_id = %params.client_id, "Authorization started");
    found(&format!("/oauth/start?{query}"))
}

async fn token(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));

    let params = if is_json {
        Json::<TokenRequest>::from_request(request, &())
            .await
            .map(|Json(p)| p)
            .map_err(|e| e.body_text())
    } else {
        Form::<TokenRequest>::from_request(request, &())
            .await
            .map(|Form(p)| p)
            .map_err(|e| e.body_text())
    };
    let params = match params {
        Ok(p) => p,
        Err(description) => {
            return oauth_error(StatusCode::BAD_REQUEST, OAuthError::invalid_request(description));
        }
    };

    info!(
        grant_type = %params.grant_type,
        client_id = %params.client_id,
        code = %params.code.as_deref().map_or_else(|| "missing".to_string(), tail),
        has_code_verifier = params.code_verifier.is_some(),
        "Token request"
    );

    match state.oauth.exchange_code_for_token(&params) {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            warn!(client_id = %params.client_id, error = %err, "Token request rejected");
            oauth_error(StatusCode::BAD_REQUEST, err)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartQuery {
    #[serde(rename = "userKey")]
    user_key: Option<String>,
    #[serde(rename = "authKey")]
    auth_key: Option<String>,
    client_id: Option<String>,
    redirect_uri: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    state: Option<String>,
}

async fn oauth_start(State(state): State<Arc<AppState>>, Query(q): Query<StartQuery>) -> Response {
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    let Some(user_key) = non_empty(q.user_key).or(non_empty(q.auth_key)) else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing userKey parameter. Add ?userKey=your_user_key to URL",
        )
            .into_response();
    };

    let inner = state.sessions.create_oauth_state(&user_key);
    let upstream_state = match (non_empty(q.client_id), non_empty(q.redirect_uri)) {
        (Some(client_id), Some(redirect_uri)) => bridge::compose_state(
            &inner,
            &BridgeParams {
                client_id,
                redirect_uri,
                code_challenge: q.code_challenge.unwrap_or_default(),
                code_challenge_method: non_empty(q.code_challenge_method)
                    .unwrap_or_else(|| METHOD_S256.to_string()),
                mcp_state: non_empty(q.state),
            },
        ),
        _ => inner,
    };

    match state.auth.authorize_url(&upstream_state) {
        Ok(url) => {
            debug!(user_key = %user_key, "Redirecting to upstream consent");
            found(&url)
        }
        Err(e) => {
            error!(user_key = %user_key, error = %e, "OAuth start failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "OAuth start failed").into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(q): Query<CallbackQuery>,
) -> Response {
    if let Some(err) = q.error.as_deref() {
        warn!(error = %err, "Upstream authorization denied");
        return error_html(
            StatusCode::BAD_REQUEST,
            err,
            q.error_description.as_deref().unwrap_or("The CRM did not grant access"),
        );
    }
    let (Some(code), Some(full_state)) = (
        q.code.filter(|c| !c.is_empty()),
        q.state.filter(|s| !s.is_empty()),
    ) else {
        return error_html(StatusCode::BAD_REQUEST, "invalid_request", "Missing code or state");
    };

    let (inner, bridge_params) = bridge::parse_state(&full_state);
    info!(
        code = %tail(&code),
        has_mcp_params = bridge_params.is_some(),
        "OAuth callback received"
    );
    if inner.is_empty() {
        return error_html(StatusCode::BAD_REQUEST, "invalid_request", "Invalid state format");
    }
    let Some(user_key) = state.sessions.consume_oauth_state(inner) else {
        warn!("Unknown or expired upstream state");
        return error_html(StatusCode::BAD_REQUEST, "invalid_request", "Unknown or expired state");
    };

    let finished = context::with_context(
        RequestContext::for_user(user_key.clone()),
        state.auth.finish_authorization(&code),
    )
    .await;
    if let Err(e) = finished {
        error!(user_key = %user_key, error = %e, "OAuth callback failed");
        return error_html(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "OAuth callback failed",
        );
    }

    let bound = state.sessions.map_all_sessions_to_user(&user_key);
    info!(user_key = %user_key, session_count = bound.len(), "Sessions bound to user");

    let Some(params) = bridge_params else {
        return Html(pages::success_page()).into_response();
    };

    if !state
        .oauth
        .is_registered_redirect(&params.client_id, &params.redirect_uri)
    {
        warn!(client_id = %params.client_id, "Callback redirect_uri not registered");
        return error_html(StatusCode::BAD_REQUEST, "invalid_request", "Invalid redirect_uri");
    }

    if let Some(mcp_state) = params.mcp_state.as_deref() {
        if !state.oauth.validate_state(mcp_state, &params.client_id) {
            warn!(client_id = %params.client_id, "Unknown or expired client state");
            return match with_query(
                &params.redirect_uri,
                &[
                    ("error", "invalid_request"),
                    ("error_description", "Unknown or expired state"),
                    ("state", mcp_state),
                ],
            ) {
                Some(url) => found(&url),
                None => error_html(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "Invalid redirect_uri",
                ),
            };
        }
    }

    let auth_code = state.oauth.generate_authorization_code(
        &params.client_id,
        &params.redirect_uri,
        &params.code_challenge,
        &params.code_challenge_method,
        &user_key,
    );
    let mut pairs = vec![("code", auth_code.as_str())];
    if let Some(s) = params.mcp_state.as_deref() {
        pairs.push(("state", s));
    }
    match with_query(&params.redirect_uri, &pairs) {
        Some(url) => found(&url),
        None => error_html(StatusCode::BAD_REQUEST, "invalid_request", "Invalid redirect_uri"),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RevokeQuery {
    #[serde(rename = "userKey")]
    user_key: Option<String>,
}

async fn oauth_revoke(
    State(state): State<Arc<AppState>>,
    Query(q): Query<RevokeQuery>,
) -> Response {
    let Some(user_key) = q.user_key.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing userKey parameter").into_response();
    };

    let revoked = context::with_context(
        RequestContext::for_user(user_key.clone()),
        state.auth.revoke(),
    )
    .await;
    match revoked {
        Ok(()) => {
            info!(user_key = %user_key, "Upstream authorization revoked");
            (StatusCode::OK, "Revoked").into_response()
        }
        Err(e) => {
            error!(user_key = %user_key, error = %e, "OAuth revoke failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "OAuth revoke failed").into_response()
        }
    }
}
