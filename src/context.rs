//! Request-scoped identity propagation.
//!
//! Every inbound request is handled inside a [`RequestContext`] scope that
//! carries the caller's `user_key` and `session_id`. The scope lives in a
//! `tokio::task_local!` slot, so any code awaited from the request handler
//! (tool dispatch, the upstream HTTP client, auth providers) can read it
//! without threading it through every signature.
//!
//! The slot is installed with [`with_context`] and is removed when the
//! scoped future completes, errors, panics, or is dropped. Tasks spawned with
//! `tokio::spawn` do **not** inherit the scope.
//!
//! # Example
//!
//! ```rust,ignore
//! use crm_mcp_gateway::context::{self, RequestContext};
//!
//! let ctx = RequestContext::for_user("alice");
//! context::with_context(ctx, async {
//!     assert_eq!(context::user_key().as_deref(), Some("alice"));
//! }).await;
//! ```

use crate::session::SessionContext;

tokio::task_local! {
    /// Task-local storage for the current request identity.
    static REQUEST_CONTEXT: RequestContext;
}

/// Identity of the request currently being handled
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Stable end-user identifier, when already resolved
    pub user_key: Option<String>,
    /// Inbound session identifier, when the request belongs to a session
    pub session_id: Option<String>,
}

impl RequestContext {
    /// Build a context from optional parts. Empty strings count as absent.
    #[must_use]
    pub fn new(user_key: Option<String>, session_id: Option<String>) -> Self {
        Self {
            user_key: user_key.filter(|k| !k.is_empty()),
            session_id: session_id.filter(|s| !s.is_empty()),
        }
    }

    /// Context carrying only a user key
    #[must_use]
    pub fn for_user(user_key: impl Into<String>) -> Self {
        Self::new(Some(user_key.into()), None)
    }
}

/// Run `future` with `ctx` installed as the current request context.
///
/// Nested scopes shadow the outer one for their duration.
pub async fn with_context<F, T>(ctx: RequestContext, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    REQUEST_CONTEXT.scope(ctx, future).await
}

/// The context of the current task, if any
#[must_use]
pub fn current() -> Option<RequestContext> {
    REQUEST_CONTEXT.try_with(Clone::clone).ok()
}

/// The explicit user key of the current request
#[must_use]
pub fn user_key() -> Option<String> {
    REQUEST_CONTEXT.try_with(|c| c.user_key.clone()).ok().flatten()
}

/// The session id of the current request
#[must_use]
pub fn session_id() -> Option<String> {
    REQUEST_CONTEXT.try_with(|c| c.session_id.clone()).ok().flatten()
}

/// Resolve the user the current request acts for.
///
/// Order: explicit `user_key`, then the user bound to the request's session,
/// then the session id itself (a session that has not been bound yet acts as
/// its own user until authorization completes).
#[must_use]
pub fn effective_user_key(sessions: &SessionContext) -> Option<String> {
    let ctx = current()?;
    if ctx.user_key.is_some() {
        return ctx.user_key;
    }
    let session_id = ctx.session_id?;
    sessions
        .get_session(&session_id)
        .and_then(|s| s.user_key)
        .or(Some(session_id))
}
