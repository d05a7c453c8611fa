//! Outbound HTTP to the CRM with a bounded auth retry

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::token_endpoint::body_snippet;
use crate::auth::{AuthProvider, JSON_ACCEPT, XML_ACCEPT};
use crate::{Error, Result};

/// Current-user service path, relative to the CRM base URL
pub const USER_INFO_PATH: &str = "/0/ServiceModel/UserInfoService.svc/getCurrentUserInfo";

/// HTTP client that authenticates every call through the [`AuthProvider`]
pub struct UpstreamClient {
    http: Client,
    auth: Arc<AuthProvider>,
    base_url: String,
}

impl UpstreamClient {
    /// Create a client for `base_url`
    pub fn new(base_url: &str, auth: Arc<AuthProvider>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            auth,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `{base}/0/odata`
    pub fn odata_root(&self) -> String {
        format!("{}/0/odata", self.base_url)
    }

    /// `{base}/0/odata/{entity}`
    pub fn entity_url(&self, entity: &str) -> String {
        format!("{}/{}", self.odata_root(), entity.trim_matches('/'))
    }

    /// `{base}/0/odata/$metadata`
    pub fn metadata_url(&self) -> String {
        format!("{}/$metadata", self.odata_root())
    }

    /// Current-user service URL
    pub fn user_info_url(&self) -> String {
        format!("{}{USER_INFO_PATH}", self.base_url)
    }

    /// JSON request headers
    pub async fn json_headers(&self) -> Result<HeaderMap> {
        self.headers(JSON_ACCEPT).await
    }

    async fn headers(&self, accept: &str) -> Result<HeaderMap> {
        self.auth.get_headers(accept, accept == JSON_ACCEPT).await
    }

    /// Send a request built from fresh headers.
    ///
    /// On a 401 the provider is refreshed once, the headers are rebuilt and
    /// the request is sent again. Every other outcome, including a second
    /// 401, is returned as-is.
    pub async fn fetch_with_auth<F, Fut>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: F,
    ) -> Result<Response>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<HeaderMap>>,
    {
        let mut tried_refresh = false;
        loop {
            let headers = headers().await?;
            debug!(
                method = %method,
                url = %url,
                has_auth = headers.contains_key(reqwest::header::AUTHORIZATION),
                "Upstream request"
            );

            let mut request = self.http.request(method.clone(), url).headers(headers.clone());
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            warn!(url = %url, tried_refresh, "Upstream answered 401");
            if tried_refresh {
                return Ok(response);
            }
            tried_refresh = true;
            self.auth.refresh(&headers).await?;
        }
    }

    async fn checked(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        accept: &str,
    ) -> Result<Response> {
        let started = Instant::now();
        let response = self
            .fetch_with_auth(method.clone(), url, body, || self.headers(accept))
            .await?;
        let status = response.status();
        let elapsed_ms = started.elapsed().as_millis();
        if status.is_success() {
            debug!(
                method = %method,
                url = %url,
                status = status.as_u16(),
                elapsed_ms,
                "Upstream request succeeded"
            );
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        warn!(
            method = %method,
            url = %url,
            status = status.as_u16(),
            elapsed_ms,
            "Upstream request failed"
        );
        Err(Error::Upstream {
            status: status.as_u16(),
            body: body_snippet(&text),
        })
    }

    /// Send with JSON headers; non-2xx becomes [`Error::Upstream`].
    /// An empty success body yields `Value::Null`.
    pub async fn fetch_json(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let response = self.checked(method, url, body, JSON_ACCEPT).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Send with JSON headers and return the body text
    pub async fn fetch_text(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<String> {
        let response = self.checked(method, url, body, JSON_ACCEPT).await?;
        Ok(response.text().await?)
    }

    /// GET with `Accept: application/xml` and no JSON content type
    pub async fn fetch_xml(&self, url: &str) -> Result<String> {
        let response = self.checked(Method::GET, url, None, XML_ACCEPT).await?;
        Ok(response.text().await?)
    }
}
