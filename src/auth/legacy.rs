//! Cookie + CSRF session login

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{Client, redirect};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{JSON_ACCEPT, build_headers, header_value};
use crate::config::LegacyAuth;
use crate::{Error, Result};

/// Login service path, relative to the CRM base URL
pub const LOGIN_PATH: &str = "/ServiceModel/AuthService.svc/Login";

/// Name of the CSRF cookie echoed back as a header
pub const CSRF_COOKIE: &str = "BPMCSRF";

/// Header carrying the CSRF token (header names are case-insensitive)
const CSRF_HEADER: HeaderName = HeaderName::from_static("bpmcsrf");

const FORCE_USE_SESSION: HeaderName = HeaderName::from_static("forceusesession");

#[derive(Debug, Clone)]
struct LegacySession {
    cookie_header: String,
    csrf: Option<String>,
}

/// Parse `Set-Cookie` values into `(name, value)` pairs, dropping attributes
pub fn parse_set_cookie<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
    values
        .into_iter()
        .filter_map(|raw| {
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Session-cookie authentication
pub struct LegacyProvider {
    http: Client,
    login_url: String,
    credentials: LegacyAuth,
    session: RwLock<Option<Arc<LegacySession>>>,
    login_lock: Mutex<()>,
}

impl LegacyProvider {
    /// Create a provider for `base_url`
    pub fn new(base_url: &str, credentials: LegacyAuth, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build login client: {e}")))?;
        Ok(Self {
            http,
            login_url: format!("{}{LOGIN_PATH}", base_url.trim_end_matches('/')),
            credentials,
            session: RwLock::new(None),
            login_lock: Mutex::new(()),
        })
    }

    /// Headers carrying the session cookie and CSRF token
    pub async fn get_headers(&self, accept: &str, is_json: bool) -> Result<HeaderMap> {
        let session = self.ensure_session().await?;
        let mut headers = build_headers(accept, is_json, None)?;
        headers.insert(FORCE_USE_SESSION, HeaderValue::from_static("true"));
        headers.insert(COOKIE, header_value(&session.cookie_header)?);
        if let Some(csrf) = &session.csrf {
            headers.insert(CSRF_HEADER, header_value(csrf)?);
        }
        Ok(headers)
    }

    /// Log in again unless the session behind `stale` was already replaced
    pub async fn refresh(&self, stale: &HeaderMap) -> Result<()> {
        let stale_cookie = stale.get(COOKIE).and_then(|v| v.to_str().ok());

        let _guard = self.login_lock.lock().await;
        let replaced = self
            .session
            .read()
            .as_ref()
            .is_some_and(|s| Some(s.cookie_header.as_str()) != stale_cookie);
        if replaced {
            debug!(auth = "legacy", "Session already replaced, skipping login");
            return Ok(());
        }

        *self.session.write() = None;
        let session = Arc::new(self.login().await?);
        *self.session.write() = Some(session);
        Ok(())
    }

    /// Forget the session
    pub fn revoke(&self) {
        *self.session.write() = None;
    }

    async fn ensure_session(&self) -> Result<Arc<LegacySession>> {
        if let Some(session) = self.session.read().clone() {
            return Ok(session);
        }

        let _guard = self.login_lock.lock().await;
        if let Some(session) = self.session.read().clone() {
            return Ok(session);
        }

        let session = Arc::new(self.login().await?);
        *self.session.write() = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn login(&self) -> Result<LegacySession> {
        info!(url = %self.login_url, auth = "legacy", "Upstream login started");

        let response = self
            .http
            .post(&self.login_url)
            .headers(build_headers(JSON_ACCEPT, true, None)?)
            .json(&json!({
                "UserName": self.credentials.login,
                "UserPassword": self.credentials.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                url = %self.login_url,
                status = status.as_u16(),
                body = %super::token_endpoint::body_snippet(&body),
                "Upstream login failed"
            );
            return Err(Error::upstream_auth(format!("auth_failed:{}", status.as_u16())));
        }

        let pairs = parse_set_cookie(
            response
                .headers()
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        if pairs.is_empty() {
            error!(url = %self.login_url, "Upstream login returned no cookies");
            return Err(Error::upstream_auth("auth_failed:no_set_cookie"));
        }

        let cookie_header = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        let csrf = pairs
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(CSRF_COOKIE))
            .map(|(_, value)| value.clone());

        info!(
            auth = "legacy",
            cookies = pairs.len(),
            has_csrf = csrf.is_some(),
            "Upstream login succeeded"
        );
        Ok(LegacySession {
            cookie_header,
            csrf,
        })
    }
}
