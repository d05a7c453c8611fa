//! Streamable HTTP `/mcp` endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::auth::BearerUser;
use super::router::AppState;
use crate::context::{self, RequestContext};
use crate::error::rpc_codes;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId, initialize_result};
use crate::session::HttpSessionTransport;

/// Session header
pub const SESSION_HEADER: &str = "mcp-session-id";

fn session_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn rpc_error_response(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(JsonRpcResponse::error(None, code, message)),
    )
        .into_response()
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// `POST /mcp`
pub(super) async fn handle_post(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
) -> Response {
    let (parts, body) = request.into_parts();
    let bearer_user = parts.extensions.get::<BearerUser>().map(|u| u.0.clone());
    let remote_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());

    let bytes = match axum::body::to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                &format!("Failed to read body: {e}"),
            );
        }
    };
    let value: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                rpc_codes::PARSE_ERROR,
                &format!("Invalid JSON: {e}"),
            );
        }
    };
    let message: JsonRpcRequest = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                rpc_codes::INVALID_REQUEST,
                &format!("Invalid JSON-RPC request: {e}"),
            );
        }
    };

    let session_id = match session_header(&parts.headers) {
        Some(id) if state.sessions.has_session(id) => id.to_string(),
        None if message.method == "initialize" => {
            open_session(&state, bearer_user.clone(), remote_ip)
        }
        _ => {
            return rpc_error_response(
                StatusCode::BAD_REQUEST,
                rpc_codes::SERVER_ERROR_START,
                "Bad Request: No valid session ID provided",
            );
        }
    };

    let session_user = state
        .sessions
        .get_session(&session_id)
        .and_then(|s| s.user_key);
    if let Some(user) = bearer_user.as_deref() {
        if session_user.as_deref() != Some(user) {
            state.sessions.set_session_user_key(&session_id, user);
        }
    }
    let user_key = bearer_user.or(session_user);

    let ctx = RequestContext::new(user_key, Some(session_id.clone()));
    let dispatched = tokio::time::timeout(
        state.request_timeout,
        context::with_context(ctx, dispatch(&state, &session_id, message.clone())),
    )
    .await;

    let response = match dispatched {
        Ok(Some(rpc)) => (StatusCode::OK, Json(rpc)).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(_) => {
            warn!(session_id = %session_id, method = %message.method, "Request timed out");
            match message.id {
                Some(id) => (
                    StatusCode::OK,
                    Json(JsonRpcResponse::error(
                        Some(id),
                        rpc_codes::INTERNAL_ERROR,
                        "Request timed out",
                    )),
                )
                    .into_response(),
                None => StatusCode::ACCEPTED.into_response(),
            }
        }
    };
    with_session_header(response, &session_id)
}

fn open_session(state: &AppState, user_key: Option<String>, remote_ip: Option<String>) -> String {
    let session_id = uuid::Uuid::new_v4().to_string();
    state
        .sessions
        .create_session(&session_id, user_key.clone(), remote_ip);
    state
        .sessions
        .set_session_transport(&session_id, Arc::new(HttpSessionTransport::new()));
    info!(
        session_id = %session_id,
        user_key = user_key.as_deref().unwrap_or("-"),
        "MCP session opened"
    );
    session_id
}

/// Handle one JSON-RPC message; `None` for notifications
async fn dispatch(
    state: &AppState,
    session_id: &str,
    message: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let Some(id) = message.id.clone() else {
        debug!(session_id = %session_id, method = %message.method, "Notification received");
        return None;
    };

    let response = match message.method.as_str() {
        "initialize" => {
            let first = state
                .sessions
                .get_session(session_id)
                .is_some_and(|s| !s.is_logged);
            if first && state.sessions.mark_session_logged(session_id) {
                info!(session_id = %session_id, "MCP connection established");
            }
            JsonRpcResponse::success(
                id,
                initialize_result(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            )
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": state.tools.list() })),
        "tools/call" => call_tool(state, id, message.params).await,
        other => JsonRpcResponse::error(
            Some(id),
            rpc_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        ),
    };
    Some(response)
}

async fn call_tool(state: &AppState, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
    let params = params.unwrap_or_default();
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::error(Some(id), rpc_codes::INVALID_PARAMS, "Missing tool name");
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match state.tools.call(name, arguments).await {
        Ok(result) => match serde_json::to_value(result) {
            Ok(v) => JsonRpcResponse::success(id, v),
            Err(e) => JsonRpcResponse::error(Some(id), rpc_codes::INTERNAL_ERROR, e.to_string()),
        },
        Err(e) => JsonRpcResponse::error(Some(id), e.to_rpc_code(), e.to_string()),
    }
}

/// `GET /mcp`: no server-initiated stream
pub(super) async fn handle_get() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, DELETE")],
        Json(JsonRpcResponse::error(
            None,
            rpc_codes::SERVER_ERROR_START,
            "Method not allowed. Use POST to send JSON-RPC requests to /mcp",
        )),
    )
        .into_response()
}

/// `DELETE /mcp`: end the session
pub(super) async fn handle_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    match session_header(&headers) {
        Some(id) if state.sessions.has_session(id) => {
            state.sessions.delete_session(id);
            info!(session_id = %id, "Session terminated by client");
            StatusCode::OK.into_response()
        }
        Some(id) => {
            debug!(session_id = %id, "Session not found for DELETE");
            rpc_error_response(
                StatusCode::BAD_REQUEST,
                rpc_codes::SERVER_ERROR_START,
                "Invalid or missing session ID",
            )
        }
        None => rpc_error_response(
            StatusCode::BAD_REQUEST,
            rpc_codes::SERVER_ERROR_START,
            "Invalid or missing session ID",
        ),
    }
}
