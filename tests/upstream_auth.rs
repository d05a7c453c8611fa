//! Upstream authentication against a mock CRM
//!
//! Covers:
//! - Legacy cookie login, once under concurrency
//! - Client-credentials token caching
//! - Retry exactly once after a 401
//! - Single-flight refresh of per-user tokens

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use reqwest::Method;
use reqwest::header;

use common::{CC_CLIENT_ID, CC_CLIENT_SECRET, LOGIN, PASSWORD, spawn_mock_crm};
use crm_mcp_gateway::auth::{AuthProvider, JSON_ACCEPT, ProviderSettings};
use crm_mcp_gateway::config::{AuthConfig, AuthorizationCodeAuth, ClientCredentialsAuth, LegacyAuth};
use crm_mcp_gateway::context::{RequestContext, with_context};
use crm_mcp_gateway::Error;
use crm_mcp_gateway::session::{DEFAULT_REFRESH_PERIOD, SessionContext, UserTokens, now_ms};
use crm_mcp_gateway::upstream::UpstreamClient;

fn settings(base_url: &str) -> ProviderSettings {
    ProviderSettings {
        base_url: base_url.to_string(),
        public_url: "http://gw.test".to_string(),
        timeout: Duration::from_secs(5),
        refresh_period: DEFAULT_REFRESH_PERIOD,
    }
}

fn client(base_url: &str, auth: &AuthConfig, sessions: Arc<SessionContext>) -> UpstreamClient {
    let provider = AuthProvider::from_config(auth, &settings(base_url), sessions).unwrap();
    UpstreamClient::new(base_url, Arc::new(provider), Duration::from_secs(5)).unwrap()
}

fn legacy() -> AuthConfig {
    AuthConfig::Legacy(LegacyAuth {
        login: LOGIN.to_string(),
        password: PASSWORD.to_string(),
    })
}

fn client_credentials(secret: &str) -> AuthConfig {
    AuthConfig::OAuth2(ClientCredentialsAuth {
        client_id: CC_CLIENT_ID.to_string(),
        client_secret: secret.to_string(),
        scope: None,
        id_base_url: None,
    })
}

fn authorization_code() -> AuthConfig {
    AuthConfig::OAuth2Code(AuthorizationCodeAuth {
        client_id: "gw".to_string(),
        client_secret: Some("gw-secret".to_string()),
        redirect_uri: "http://gw.test/oauth/callback".to_string(),
        scope: None,
        id_base_url: None,
    })
}

#[tokio::test]
async fn legacy_logs_in_once_under_concurrency() {
    let crm = spawn_mock_crm().await;
    let upstream = Arc::new(client(&crm.base_url, &legacy(), Arc::new(SessionContext::new())));
    let url = upstream.entity_url("Contact");

    let calls: Vec<_> = (0..10)
        .map(|_| {
            let upstream = Arc::clone(&upstream);
            let url = url.clone();
            tokio::spawn(async move { upstream.fetch_json(Method::GET, &url, None).await })
        })
        .collect();
    for call in calls {
        let body = call.await.unwrap().unwrap();
        assert_eq!(body["value"][0]["Name"], "Ada");
    }

    assert_eq!(crm.state.logins.load(Ordering::SeqCst), 1);
    assert_eq!(crm.state.odata_calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn legacy_bad_credentials_surface_status_code() {
    let crm = spawn_mock_crm().await;
    let auth = AuthConfig::Legacy(LegacyAuth {
        login: LOGIN.to_string(),
        password: "wrong".to_string(),
    });
    let upstream = client(&crm.base_url, &auth, Arc::new(SessionContext::new()));

    let err = upstream.json_headers().await.unwrap_err();
    match err {
        Error::UpstreamAuth { code } => assert_eq!(code, "auth_failed:401"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn legacy_relogs_once_after_401() {
    let crm = spawn_mock_crm().await;
    let upstream = client(&crm.base_url, &legacy(), Arc::new(SessionContext::new()));
    crm.state.reject_next.store(1, Ordering::SeqCst);

    let body = upstream
        .fetch_json(Method::GET, &upstream.entity_url("Contact"), None)
        .await
        .unwrap();

    assert_eq!(body["value"][0]["Id"], "1");
    assert_eq!(crm.state.logins.load(Ordering::SeqCst), 2);
    assert_eq!(crm.state.odata_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn late_legacy_refresh_keeps_the_replacement_session() {
    let crm = spawn_mock_crm().await;
    let sessions = Arc::new(SessionContext::new());
    let provider =
        AuthProvider::from_config(&legacy(), &settings(&crm.base_url), sessions).unwrap();

    let stale = provider.get_headers(JSON_ACCEPT, true).await.unwrap();
    provider.refresh(&stale).await.unwrap();
    let fresh = provider.get_headers(JSON_ACCEPT, true).await.unwrap();
    assert_ne!(fresh[header::COOKIE], stale[header::COOKIE]);

    provider.refresh(&stale).await.unwrap();
    assert_eq!(crm.state.logins.load(Ordering::SeqCst), 2);
    let current = provider.get_headers(JSON_ACCEPT, true).await.unwrap();
    assert_eq!(current[header::COOKIE], fresh[header::COOKIE]);

    provider.refresh(&current).await.unwrap();
    assert_eq!(crm.state.logins.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn late_client_credentials_refresh_keeps_the_replacement_token() {
    let crm = spawn_mock_crm().await;
    let provider = AuthProvider::from_config(
        &client_credentials(CC_CLIENT_SECRET),
        &settings(&crm.base_url),
        Arc::new(SessionContext::new()),
    )
    .unwrap();

    let stale = provider.get_headers(JSON_ACCEPT, true).await.unwrap();
    assert_eq!(stale[header::AUTHORIZATION], "Bearer at-1");
    provider.refresh(&stale).await.unwrap();
    provider.refresh(&stale).await.unwrap();

    assert_eq!(crm.state.grants("client_credentials"), 2);
    let current = provider.get_headers(JSON_ACCEPT, true).await.unwrap();
    assert_eq!(current[header::AUTHORIZATION], "Bearer at-2");
}

#[tokio::test]
async fn persistent_401_is_retried_exactly_once() {
    let crm = spawn_mock_crm().await;
    let upstream = client(
        &crm.base_url,
        &client_credentials(CC_CLIENT_SECRET),
        Arc::new(SessionContext::new()),
    );
    crm.state.reject_next.store(5, Ordering::SeqCst);

    let err = upstream
        .fetch_json(Method::GET, &upstream.entity_url("Contact"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Upstream { status: 401, .. }), "got {err}");
    assert_eq!(crm.state.odata_calls.load(Ordering::SeqCst), 2);
    assert_eq!(crm.state.grants("client_credentials"), 2);
}

#[tokio::test]
async fn client_credentials_token_is_cached() {
    let crm = spawn_mock_crm().await;
    let upstream = client(
        &crm.base_url,
        &client_credentials(CC_CLIENT_SECRET),
        Arc::new(SessionContext::new()),
    );

    for _ in 0..3 {
        upstream
            .fetch_json(Method::GET, &upstream.entity_url("Account"), None)
            .await
            .unwrap();
    }

    assert_eq!(crm.state.grants("client_credentials"), 1);
    let request = crm.state.token_requests.lock()[0].clone();
    assert_eq!(request["client_id"], CC_CLIENT_ID);
    assert_eq!(request["client_secret"], CC_CLIENT_SECRET);
}

#[tokio::test]
async fn client_credentials_rejection_is_upstream_auth_error() {
    let crm = spawn_mock_crm().await;
    let upstream = client(
        &crm.base_url,
        &client_credentials("nope"),
        Arc::new(SessionContext::new()),
    );

    let err = upstream.json_headers().await.unwrap_err();
    match err {
        Error::UpstreamAuth { code } => assert_eq!(code, "oauth2_auth_failed"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn concurrent_stale_callers_share_one_refresh() {
    let crm = spawn_mock_crm().await;
    crm.state.add_refresh_token("rt-seed");
    crm.state.token_delay_ms.store(100, Ordering::SeqCst);

    let sessions = Arc::new(SessionContext::new());
    sessions.set_tokens_for_user(
        "bob",
        UserTokens {
            access_token: "stale".to_string(),
            access_token_expiry_ms: now_ms() - 1,
            refresh_token: Some("rt-seed".to_string()),
        },
    );
    let provider = Arc::new(
        AuthProvider::from_config(
            &authorization_code(),
            &settings(&crm.base_url),
            Arc::clone(&sessions),
        )
        .unwrap(),
    );

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let provider = Arc::clone(&provider);
            tokio::spawn(with_context(RequestContext::for_user("bob"), async move {
                provider.get_headers(JSON_ACCEPT, true).await
            }))
        })
        .collect();
    for call in calls {
        let headers = call.await.unwrap().unwrap();
        assert_eq!(headers["authorization"], "Bearer at-1");
    }

    assert_eq!(crm.state.grants("refresh_token"), 1);
    let tokens = sessions.tokens_for_user("bob").unwrap();
    assert_eq!(tokens.access_token, "at-1");
    assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
    provider.shutdown();
}

#[tokio::test]
async fn rejected_refresh_discards_tokens_and_needs_consent() {
    let crm = spawn_mock_crm().await;
    let sessions = Arc::new(SessionContext::new());
    sessions.set_tokens_for_user(
        "carol",
        UserTokens {
            access_token: "stale".to_string(),
            access_token_expiry_ms: now_ms() - 1,
            refresh_token: Some("rt-unknown".to_string()),
        },
    );
    let provider = AuthProvider::from_config(
        &authorization_code(),
        &settings(&crm.base_url),
        Arc::clone(&sessions),
    )
    .unwrap();

    let err = with_context(
        RequestContext::for_user("carol"),
        provider.get_headers(JSON_ACCEPT, true),
    )
    .await
    .unwrap_err();

    match err {
        Error::NeedsConsent { consent_url } => assert_eq!(
            consent_url.as_deref(),
            Some("http://gw.test/oauth/start?userKey=carol")
        ),
        other => panic!("unexpected error: {other}"),
    }
    assert!(sessions.tokens_for_user("carol").is_none());
}

#[tokio::test]
async fn code_flow_401_triggers_one_refresh_then_succeeds() {
    let crm = spawn_mock_crm().await;
    crm.state.add_refresh_token("rt-seed");
    let sessions = Arc::new(SessionContext::new());
    sessions.set_tokens_for_user(
        "dave",
        UserTokens {
            access_token: "revoked-upstream".to_string(),
            access_token_expiry_ms: i64::MAX,
            refresh_token: Some("rt-seed".to_string()),
        },
    );
    let upstream = client(&crm.base_url, &authorization_code(), Arc::clone(&sessions));

    let body = with_context(
        RequestContext::for_user("dave"),
        upstream.fetch_json(Method::GET, &upstream.entity_url("Contact"), None),
    )
    .await
    .unwrap();

    assert_eq!(body["value"][0]["Name"], "Ada");
    assert_eq!(crm.state.grants("refresh_token"), 1);
    assert_eq!(crm.state.odata_calls.load(Ordering::SeqCst), 2);
    assert_eq!(sessions.tokens_for_user("dave").unwrap().access_token, "at-1");
}
