//! Client registration

use tracing::info;

use super::types::{CLIENT_GRANT_TYPES, OAuthClient};
use crate::session::now_ms;

/// Display name guessed from well-known MCP client ids
pub fn infer_client_name(client_id: &str) -> &'static str {
    if client_id.contains("claude") {
        "Claude Desktop"
    } else if client_id.contains("vscode") {
        "VS Code"
    } else if client_id.contains("cursor") {
        "Cursor"
    } else {
        "Unknown MCP Client"
    }
}

fn public_client(client_id: String, redirect_uris: Vec<String>) -> OAuthClient {
    OAuthClient {
        client_id,
        redirect_uris,
        grant_types: CLIENT_GRANT_TYPES.iter().map(ToString::to_string).collect(),
        response_types: vec!["code".to_string()],
        token_endpoint_auth_method: "none".to_string(),
        created_at: now_ms(),
    }
}

/// Register an unknown client for exactly one redirect URI
pub fn auto_register_client(client_id: &str, redirect_uri: &str) -> OAuthClient {
    let client = public_client(client_id.to_string(), vec![redirect_uri.to_string()]);
    info!(
        client_id = %client_id,
        client_name = infer_client_name(client_id),
        redirect_uri = %redirect_uri,
        "OAuth client auto-registered"
    );
    client
}

/// Register a new public client with a fresh id
pub fn create_client(redirect_uris: Vec<String>) -> OAuthClient {
    let client = public_client(uuid::Uuid::new_v4().to_string(), redirect_uris);
    info!(
        client_id = %client.client_id,
        redirect_uris = ?client.redirect_uris,
        "OAuth client registered"
    );
    client
}
