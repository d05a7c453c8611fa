//! Gateway server implementation

pub mod auth;
mod mcp;
mod oauth_routes;
mod router;
mod server;

pub use auth::{BearerUser, bearer_middleware};
pub use mcp::SESSION_HEADER;
pub use router::{AppState, create_router};
pub use server::Gateway;
