//! Mock CRM: legacy login, identity token endpoint and a small OData surface

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Response, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

pub const LOGIN: &str = "alice";
pub const PASSWORD: &str = "pw";
pub const CC_CLIENT_ID: &str = "cc-client";
pub const CC_CLIENT_SECRET: &str = "cc-secret";
pub const UPSTREAM_CODE: &str = "upstream-code";

/// `$metadata` served by the mock: Contact and Account
pub const EDMX: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<edmx:Edmx Version="4.0" xmlns:edmx="http://docs.oasis-open.org/odata/ns/edmx">
  <edmx:DataServices>
    <Schema Namespace="Crm" xmlns="http://docs.oasis-open.org/odata/ns/edm">
      <EntityType Name="Contact">
        <Key><PropertyRef Name="Id" /></Key>
        <Property Name="Id" Type="Edm.Guid" Nullable="false" />
        <Property Name="Name" Type="Edm.String" />
      </EntityType>
      <EntityType Name="Account">
        <Key><PropertyRef Name="Id" /></Key>
        <Property Name="Id" Type="Edm.Guid" Nullable="false" />
      </EntityType>
      <EntityContainer Name="Default">
        <EntitySet Name="Contact" EntityType="Crm.Contact" />
        <EntitySet Name="Account" EntityType="Crm.Account" />
      </EntityContainer>
    </Schema>
  </edmx:DataServices>
</edmx:Edmx>"#;

/// Observable mock state
#[derive(Default)]
pub struct MockState {
    pub logins: AtomicUsize,
    pub token_requests: Mutex<Vec<HashMap<String, String>>>,
    pub revocations: AtomicUsize,
    pub odata_calls: AtomicUsize,
    /// Force a 401 on the next N OData calls
    pub reject_next: AtomicUsize,
    /// Delay on the token endpoint, to make concurrent callers overlap
    pub token_delay_ms: AtomicU64,
    /// Answer 503 on the revocation endpoint
    pub fail_revocation: AtomicBool,
    /// Answer 404 for the OData service document
    pub hide_service_document: AtomicBool,
    pub metadata_calls: AtomicUsize,
    issued: AtomicUsize,
    valid_tokens: Mutex<HashSet<String>>,
    valid_refresh: Mutex<HashSet<String>>,
    valid_cookie: Mutex<Option<String>>,
}

impl MockState {
    pub fn grants(&self, grant_type: &str) -> usize {
        self.token_requests
            .lock()
            .iter()
            .filter(|r| r.get("grant_type").map(String::as_str) == Some(grant_type))
            .count()
    }

    pub fn add_refresh_token(&self, token: &str) {
        self.valid_refresh.lock().insert(token.to_string());
    }

    pub fn invalidate_access_tokens(&self) {
        self.valid_tokens.lock().clear();
    }

    fn mint(&self) -> (String, String) {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access = format!("at-{n}");
        let refresh = format!("rt-{n}");
        self.valid_tokens.lock().insert(access.clone());
        self.valid_refresh.lock().insert(refresh.clone());
        (access, refresh)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if let Some(token) = bearer {
            return self.valid_tokens.lock().contains(token);
        }
        let cookie = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let has_csrf = headers.contains_key("bpmcsrf");
        self.valid_cookie
            .lock()
            .as_deref()
            .is_some_and(|c| has_csrf && cookie.contains(c))
    }
}

/// Running mock server
pub struct MockCrm {
    pub base_url: String,
    pub state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl Drop for MockCrm {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_mock_crm() -> MockCrm {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/ServiceModel/AuthService.svc/Login", post(login))
        .route("/0/connect/token", post(token))
        .route("/0/connect/revocation", post(revocation))
        .route(
            "/0/ServiceModel/UserInfoService.svc/getCurrentUserInfo",
            post(user_info),
        )
        .route("/0/odata/", get(service_document))
        .route("/0/odata/{entity}", get(odata_list))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockCrm {
        base_url: format!("http://{addr}"),
        state,
        handle,
    }
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response<Body> {
    if body["UserName"] != LOGIN || body["UserPassword"] != PASSWORD {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    let session = format!("sess-{n}");
    *state.valid_cookie.lock() = Some(session.clone());

    Response::builder()
        .status(StatusCode::OK)
        .header(header::SET_COOKIE, format!(".ASPXAUTH={session}; path=/; HttpOnly"))
        .header(header::SET_COOKIE, format!("BPMCSRF=csrf-{n}; path=/"))
        .body(Body::from(r#"{"Code":0}"#))
        .unwrap()
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response<Body> {
    state.token_requests.lock().push(form.clone());
    let delay = state.token_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let field = |k: &str| form.get(k).map(String::as_str).unwrap_or_default();
    let ok = match field("grant_type") {
        "client_credentials" => {
            field("client_id") == CC_CLIENT_ID && field("client_secret") == CC_CLIENT_SECRET
        }
        "authorization_code" => field("code") == UPSTREAM_CODE,
        "refresh_token" => state.valid_refresh.lock().remove(field("refresh_token")),
        _ => false,
    };
    if !ok {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        )
            .into_response();
    }

    let (access, refresh) = state.mint();
    let mut body = json!({
        "access_token": access,
        "token_type": "Bearer",
        "expires_in": 3600,
    });
    if field("grant_type") != "client_credentials" {
        body["refresh_token"] = json!(refresh);
    }
    Json(body).into_response()
}

async fn revocation(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    state.revocations.fetch_add(1, Ordering::SeqCst);
    if state.fail_revocation.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    if let Some(token) = form.get("token") {
        state.valid_refresh.lock().remove(token);
    }
    StatusCode::OK
}

async fn user_info(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response<Body> {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"userId": "u-1", "contactName": "Alice"})).into_response()
}

async fn service_document(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
) -> Response<Body> {
    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if state.hide_service_document.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "value": [
            {"name": "Contact", "kind": "EntitySet", "url": "Contact"},
            {"name": "Account", "kind": "EntitySet", "url": "Account"},
        ]
    }))
    .into_response()
}

async fn odata_list(
    State(state): State<Arc<MockState>>,
    Path(entity): Path<String>,
    headers: HeaderMap,
) -> Response<Body> {
    if entity == "$metadata" {
        return metadata(&state, &headers);
    }
    state.odata_calls.fetch_add(1, Ordering::SeqCst);
    let forced = state
        .reject_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if forced || !state.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    Json(json!({
        "value": [{"Id": "1", "Name": "Ada", "Entity": entity}]
    }))
    .into_response()
}

fn metadata(state: &MockState, headers: &HeaderMap) -> Response<Body> {
    state.metadata_calls.fetch_add(1, Ordering::SeqCst);
    if !state.authorized(headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) != Some("application/xml") {
        return StatusCode::NOT_ACCEPTABLE.into_response();
    }
    ([(header::CONTENT_TYPE, "application/xml")], EDMX).into_response()
}

/// Collect a response body as JSON
pub async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Collect a response body as text
pub async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}
