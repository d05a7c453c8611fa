//! CRM MCP Gateway Library
//!
//! Exposes a CRM's OData API to MCP clients over Streamable HTTP.
//!
//! # Features
//!
//! - **Three upstream auth flows**: legacy cookie session, OAuth2
//!   client-credentials, and per-user OAuth2 authorization code
//! - **Retry once on 401**: stale upstream credentials are refreshed transparently
//! - **Embedded OAuth 2.1 server**: PKCE, dynamic and automatic client
//!   registration, gateway-issued JWT access tokens
//! - **Background refresh**: per-user token refresh while sessions are open
//! - **Request context**: the acting user and session follow each request
//!   through a task-local scope

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod metadata;
pub mod oauth;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod upstream;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("Failed to initialise tracing: {e}")))
}
