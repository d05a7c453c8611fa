//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::auth::AuthKind;
use crate::config::Config;

/// MCP gateway for a CRM's OData API with per-user OAuth
#[derive(Parser, Debug)]
#[command(name = "crm-mcp-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CRM_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CRM_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CRM_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "CRM_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CRM_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Externally reachable gateway URL
    #[arg(long, env = "CRM_GATEWAY_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// CRM base URL
    #[arg(long, env = "CRM_BASE_URL")]
    pub base_url: Option<String>,

    /// Hide and refuse write tools
    #[arg(long, env = "CRM_READONLY")]
    pub readonly: bool,

    /// Force an auth flow instead of inferring it from credentials
    #[arg(long, value_enum)]
    pub auth: Option<AuthKind>,

    /// Legacy login
    #[arg(long, env = "CRM_LOGIN")]
    pub login: Option<String>,

    /// Legacy password
    #[arg(long, env = "CRM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Client-credentials client id
    #[arg(long, env = "CRM_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Client-credentials client secret
    #[arg(long, env = "CRM_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Identity service base URL, when it is not the CRM itself
    #[arg(long, env = "CRM_ID_BASE_URL")]
    pub id_base_url: Option<String>,

    /// Authorization-code client id
    #[arg(long, env = "CRM_CODE_CLIENT_ID")]
    pub code_client_id: Option<String>,

    /// Authorization-code client secret
    #[arg(long, env = "CRM_CODE_CLIENT_SECRET", hide_env_values = true)]
    pub code_client_secret: Option<String>,

    /// Authorization-code redirect URI registered upstream
    #[arg(long, env = "CRM_CODE_REDIRECT_URI")]
    pub code_redirect_uri: Option<String>,

    /// Authorization-code scope
    #[arg(long, env = "CRM_CODE_SCOPE")]
    pub code_scope: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Validate the configuration and print the resolved auth flow
    Check,
}

impl Cli {
    /// Apply command-line overrides on top of file and environment config
    pub fn apply(&self, config: &mut Config) {
        fn set(target: &mut Option<String>, value: Option<&String>) {
            if let Some(v) = value {
                *target = Some(v.clone());
            }
        }

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        set(&mut config.server.public_url, self.public_url.as_ref());
        if let Some(url) = &self.base_url {
            config.upstream.base_url.clone_from(url);
        }
        if self.readonly {
            config.upstream.readonly = true;
        }
        if self.auth.is_some() {
            config.auth.kind = self.auth;
        }

        let a = &mut config.auth;
        set(&mut a.login, self.login.as_ref());
        set(&mut a.password, self.password.as_ref());
        set(&mut a.client_id, self.client_id.as_ref());
        set(&mut a.client_secret, self.client_secret.as_ref());
        set(&mut a.id_base_url, self.id_base_url.as_ref());
        set(&mut a.code_client_id, self.code_client_id.as_ref());
        set(&mut a.code_client_secret, self.code_client_secret.as_ref());
        set(&mut a.code_redirect_uri, self.code_redirect_uri.as_ref());
        set(&mut a.code_scope, self.code_scope.as_ref());
    }
}
