//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::auth::AuthKind;
use crate::session::DEFAULT_REFRESH_PERIOD;
use crate::{Error, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CRM_GATEWAY_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Inbound HTTP server
    pub server: ServerConfig,
    /// Upstream CRM
    pub upstream: UpstreamConfig,
    /// Upstream credentials
    pub auth: AuthSection,
    /// Embedded authorization server
    pub oauth: OAuthServerConfig,
    /// Background token refresh
    pub refresh: RefreshConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = match (path_str.strip_prefix('~'), dirs::home_dir()) {
                (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
                _ => path_str.clone(),
            };

            let path = Path::new(&expanded);
            if !path.exists() {
                tracing::debug!("Env file not found (skipped): {expanded}");
                continue;
            }
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in URL and credential fields
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        self.upstream.base_url = expand_string(&re, &self.upstream.base_url);
        if let Some(url) = self.server.public_url.as_mut() {
            *url = expand_string(&re, url);
        }

        let a = &mut self.auth;
        for field in [
            &mut a.login,
            &mut a.password,
            &mut a.client_id,
            &mut a.client_secret,
            &mut a.scope,
            &mut a.id_base_url,
            &mut a.code_client_id,
            &mut a.code_client_secret,
            &mut a.code_redirect_uri,
            &mut a.code_scope,
        ] {
            if let Some(value) = field.as_mut() {
                *value = expand_string(&re, value);
            }
        }
    }

    /// Externally reachable gateway URL, without trailing slash
    pub fn public_url(&self) -> String {
        if let Some(url) = self.server.public_url.as_deref().filter(|u| !u.is_empty()) {
            return url.trim_end_matches('/').to_string();
        }
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "::" | "" => "localhost",
            h => h,
        };
        format!("http://{host}:{}", self.server.port)
    }

    /// Check everything that would otherwise fail later at runtime
    pub fn validate(&self) -> Result<()> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(Error::Config("upstream.base_url is required".to_string()));
        }
        url::Url::parse(&self.upstream.base_url)
            .map_err(|e| Error::Config(format!("Invalid upstream.base_url: {e}")))?;
        self.auth_config()?;
        Ok(())
    }

    /// Resolve the upstream auth variant.
    ///
    /// An explicit `auth.kind` wins. Otherwise the first complete set of
    /// credentials is used, in the order authorization code, client
    /// credentials, legacy login.
    pub fn auth_config(&self) -> Result<AuthConfig> {
        let a = &self.auth;
        let kind = match a.kind {
            Some(kind) => kind,
            None if present(&a.code_client_id) => AuthKind::OAuth2Code,
            None if present(&a.client_id) && present(&a.client_secret) => AuthKind::OAuth2,
            None if present(&a.login) && present(&a.password) => AuthKind::Legacy,
            None => {
                return Err(Error::Config(
                    "No upstream credentials: set auth.code_client_id (authorization code), \
                     auth.client_id + auth.client_secret (client credentials), \
                     or auth.login + auth.password (legacy)"
                        .to_string(),
                ));
            }
        };

        match kind {
            AuthKind::Legacy => Ok(AuthConfig::Legacy(LegacyAuth {
                login: required(&a.login, "auth.login")?,
                password: required(&a.password, "auth.password")?,
            })),
            AuthKind::OAuth2 => Ok(AuthConfig::OAuth2(ClientCredentialsAuth {
                client_id: required(&a.client_id, "auth.client_id")?,
                client_secret: required(&a.client_secret, "auth.client_secret")?,
                scope: non_empty(&a.scope),
                id_base_url: non_empty(&a.id_base_url),
            })),
            AuthKind::OAuth2Code => Ok(AuthConfig::OAuth2Code(AuthorizationCodeAuth {
                client_id: required(&a.code_client_id, "auth.code_client_id")?,
                client_secret: non_empty(&a.code_client_secret),
                redirect_uri: non_empty(&a.code_redirect_uri)
                    .unwrap_or_else(|| format!("{}/oauth/callback", self.public_url())),
                scope: non_empty(&a.code_scope),
                id_base_url: non_empty(&a.id_base_url),
            })),
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    non_empty(value).ok_or_else(|| Error::Config(format!("{name} is required")))
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally reachable URL (issuer and consent links)
    pub public_url: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            public_url: None,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 4 * 1024 * 1024,
        }
    }
}

/// Upstream CRM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// CRM base URL
    pub base_url: String,
    /// Hide and refuse write tools
    pub readonly: bool,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            readonly: false,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Raw upstream credential settings, resolved by [`Config::auth_config`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Explicit flow; inferred from the credentials when absent
    pub kind: Option<AuthKind>,
    /// Legacy login
    pub login: Option<String>,
    /// Legacy password
    pub password: Option<String>,
    /// Client-credentials client id
    pub client_id: Option<String>,
    /// Client-credentials secret
    pub client_secret: Option<String>,
    /// Client-credentials scope
    pub scope: Option<String>,
    /// Identity server base URL (defaults to the CRM base URL)
    pub id_base_url: Option<String>,
    /// Authorization-code client id
    pub code_client_id: Option<String>,
    /// Authorization-code client secret
    pub code_client_secret: Option<String>,
    /// Authorization-code redirect URI (defaults to `{public_url}/oauth/callback`)
    pub code_redirect_uri: Option<String>,
    /// Authorization-code scope (defaults to `offline_access`)
    pub code_scope: Option<String>,
}

/// Resolved upstream credentials. Exactly one variant per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    /// Cookie session login
    Legacy(LegacyAuth),
    /// Client-credentials grant
    OAuth2(ClientCredentialsAuth),
    /// Authorization-code grant
    OAuth2Code(AuthorizationCodeAuth),
}

impl AuthConfig {
    /// Flow of this variant
    pub fn kind(&self) -> AuthKind {
        match self {
            Self::Legacy(_) => AuthKind::Legacy,
            Self::OAuth2(_) => AuthKind::OAuth2,
            Self::OAuth2Code(_) => AuthKind::OAuth2Code,
        }
    }
}

/// Legacy login credentials
#[derive(Clone, PartialEq, Eq)]
pub struct LegacyAuth {
    /// User name
    pub login: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for LegacyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyAuth")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

/// Client-credentials settings
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCredentialsAuth {
    /// Client id
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Requested scope
    pub scope: Option<String>,
    /// Identity server base URL
    pub id_base_url: Option<String>,
}

impl std::fmt::Debug for ClientCredentialsAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsAuth")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("scope", &self.scope)
            .field("id_base_url", &self.id_base_url)
            .finish()
    }
}

/// Authorization-code settings
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationCodeAuth {
    /// Client id
    pub client_id: String,
    /// Client secret, for confidential clients
    pub client_secret: Option<String>,
    /// Redirect URI registered upstream
    pub redirect_uri: String,
    /// Requested scope
    pub scope: Option<String>,
    /// Identity server base URL
    pub id_base_url: Option<String>,
}

impl std::fmt::Debug for AuthorizationCodeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationCodeAuth")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("id_base_url", &self.id_base_url)
            .finish()
    }
}

/// Embedded authorization server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthServerConfig {
    /// Register unknown clients on their first authorize call
    pub auto_register: bool,
    /// Gateway access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_ttl: Duration,
    /// Authorization code lifetime
    #[serde(with = "humantime_serde")]
    pub code_ttl: Duration,
    /// Lifetime of a pending authorization waiting for upstream consent
    #[serde(with = "humantime_serde")]
    pub pending_ttl: Duration,
}

impl Default for OAuthServerConfig {
    fn default() -> Self {
        Self {
            auto_register: true,
            access_token_ttl: Duration::from_secs(3600),
            code_ttl: Duration::from_secs(10 * 60),
            pending_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Background refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Refresh period per user
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_REFRESH_PERIOD,
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "15m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "100ms", "30s", "15m", "1h" or bare seconds
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim().parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim().parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim().parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.trim().parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
