//! Carrying an MCP client's authorization through the upstream consent.
//!
//! The state sent upstream is `<inner>&client_id=…&redirect_uri=…
//! &code_challenge=…&code_challenge_method=…&mcp_state=…`. The inner state is
//! the single-use upstream state; it never contains `&`, so splitting on the
//! first `&` recovers it.

use url::form_urlencoded;

/// The pending MCP authorization carried through the upstream round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeParams {
    /// MCP client id
    pub client_id: String,
    /// MCP client redirect URI
    pub redirect_uri: String,
    /// PKCE challenge
    pub code_challenge: String,
    /// PKCE method
    pub code_challenge_method: String,
    /// State the MCP client sent to `/authorize`
    pub mcp_state: Option<String>,
}

/// Build the composite state
pub fn compose_state(inner: &str, params: &BridgeParams) -> String {
    let tail = form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", &params.client_id)
        .append_pair("redirect_uri", &params.redirect_uri)
        .append_pair("code_challenge", &params.code_challenge)
        .append_pair("code_challenge_method", &params.code_challenge_method)
        .append_pair("mcp_state", params.mcp_state.as_deref().unwrap_or(""))
        .finish();
    format!("{inner}&{tail}")
}

/// Split a state into its inner part and, when complete, the bridge params
pub fn parse_state(state: &str) -> (&str, Option<BridgeParams>) {
    let Some((inner, tail)) = state.split_once('&') else {
        return (state, None);
    };

    let mut client_id = None;
    let mut redirect_uri = None;
    let mut code_challenge = None;
    let mut code_challenge_method = None;
    let mut mcp_state = None;
    for (key, value) in form_urlencoded::parse(tail.as_bytes()) {
        let value = Some(value.into_owned()).filter(|v| !v.is_empty());
        match key.as_ref() {
            "client_id" => client_id = value,
            "redirect_uri" => redirect_uri = value,
            "code_challenge" => code_challenge = value,
            "code_challenge_method" => code_challenge_method = value,
            "mcp_state" => mcp_state = value,
            _ => {}
        }
    }

    let params = match (client_id, redirect_uri, code_challenge) {
        (Some(client_id), Some(redirect_uri), Some(code_challenge)) => Some(BridgeParams {
            client_id,
            redirect_uri,
            code_challenge,
            code_challenge_method: code_challenge_method.unwrap_or_else(|| "S256".to_string()),
            mcp_state,
        }),
        _ => None,
    };
    (inner, params)
}
