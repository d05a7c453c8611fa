//! Background refresh of upstream tokens.
//!
//! One recurring task per user. Arming a user replaces any previous task for
//! that user; a failing tick cancels the task. Tasks hold only a weak
//! reference to the scheduler, so dropping the scheduler stops them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::SessionContext;
use crate::{Error, Result};

/// Default refresh period
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Performs the actual refresh for one user
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Refresh the cached upstream tokens of `user_key`
    async fn refresh_user_tokens(&self, user_key: &str) -> Result<()>;
}

/// Scheduler counters
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefreshStats {
    /// Armed users
    pub active_refresh_count: usize,
    /// Their keys, sorted
    pub user_keys: Vec<String>,
}

struct ScheduledRefresh {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-user recurring refresh tasks
pub struct TokenRefreshScheduler {
    sessions: Arc<SessionContext>,
    refresher: Arc<dyn TokenRefresher>,
    period: Duration,
    tasks: Mutex<HashMap<String, ScheduledRefresh>>,
    next_generation: AtomicU64,
}

impl TokenRefreshScheduler {
    /// Create a scheduler
    pub fn new(
        sessions: Arc<SessionContext>,
        refresher: Arc<dyn TokenRefresher>,
        period: Duration,
    ) -> Self {
        Self {
            sessions,
            refresher,
            period,
            tasks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Arm (or re-arm) the recurring refresh of `user_key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_refresh(self: &Arc<Self>, user_key: &str) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let period = self.period;
        let task_user = user_key.to_string();
        let start = Instant::now() + period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                if let Err(e) = scheduler.tick(&task_user).await {
                    warn!(user_key = %task_user, error = %e, "Background token refresh failed");
                    scheduler.remove_if_current(&task_user, generation);
                    return;
                }
            }
        });

        let previous = self.tasks.lock().insert(
            user_key.to_string(),
            ScheduledRefresh { generation, handle },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
        info!(user_key = %user_key, period = ?self.period, "Token refresh scheduled");
    }

    async fn tick(&self, user_key: &str) -> Result<()> {
        let has_refresh_token = self
            .sessions
            .tokens_for_user(user_key)
            .is_some_and(|t| t.refresh_token.is_some());
        if !has_refresh_token {
            return Err(Error::Internal("no_refresh_token".into()));
        }

        let sessions = self.sessions.sessions_for_user(user_key);
        if sessions.is_empty() {
            return Err(Error::Internal("no_active_sessions".into()));
        }

        self.refresher.refresh_user_tokens(user_key).await?;
        info!(
            user_key = %user_key,
            sessions_count = sessions.len(),
            "Background token refresh succeeded"
        );
        Ok(())
    }

    /// Drop the entry for `user_key` only if it still belongs to `generation`.
    /// Used by a task cancelling itself; a newer task stays armed.
    fn remove_if_current(&self, user_key: &str, generation: u64) {
        let mut tasks = self.tasks.lock();
        if tasks.get(user_key).is_some_and(|t| t.generation == generation) {
            tasks.remove(user_key);
            info!(user_key = %user_key, "Token refresh cancelled");
        }
    }

    /// Stop refreshing `user_key`
    pub fn cancel(&self, user_key: &str) {
        let removed = self.tasks.lock().remove(user_key);
        if let Some(task) = removed {
            task.handle.abort();
            info!(user_key = %user_key, "Token refresh cancelled");
        }
    }

    /// Stop every task
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (_, task) in &drained {
            task.handle.abort();
        }
        debug!(count = drained.len(), "All token refreshes cancelled");
    }

    /// Whether `user_key` is armed
    pub fn is_scheduled(&self, user_key: &str) -> bool {
        self.tasks.lock().contains_key(user_key)
    }

    /// Scheduler counters
    pub fn stats(&self) -> RefreshStats {
        let tasks = self.tasks.lock();
        let mut user_keys: Vec<String> = tasks.keys().cloned().collect();
        user_keys.sort();
        RefreshStats {
            active_refresh_count: tasks.len(),
            user_keys,
        }
    }
}

impl Drop for TokenRefreshScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::session::{HttpSessionTransport, UserTokens};

    const PERIOD: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh_user_tokens(&self, _user_key: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::upstream_auth("refresh_rejected"));
            }
            Ok(())
        }
    }

    fn sessions_with_user(user_key: &str, refresh_token: Option<&str>) -> Arc<SessionContext> {
        let sessions = Arc::new(SessionContext::new());
        sessions.create_session("s1", Some(user_key.to_string()), None);
        sessions.set_session_transport("s1", Arc::new(HttpSessionTransport::new()));
        sessions.set_tokens_for_user(
            user_key,
            UserTokens {
                access_token: "at".into(),
                access_token_expiry_ms: i64::MAX,
                refresh_token: refresh_token.map(str::to_string),
            },
        );
        sessions
    }

    async fn advance_ticks(n: u32) {
        for _ in 0..n {
            tokio::time::advance(PERIOD).await;
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_every_period() {
        let sessions = sessions_with_user("alice", Some("rt"));
        let refresher = Arc::new(CountingRefresher::default());
        let scheduler = Arc::new(TokenRefreshScheduler::new(sessions, refresher.clone(), PERIOD));

        scheduler.schedule_refresh("alice");
        tokio::task::yield_now().await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);

        advance_ticks(3).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_scheduled("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_refresh_cancels_itself() {
        let sessions = sessions_with_user("alice", Some("rt"));
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let scheduler = Arc::new(TokenRefreshScheduler::new(sessions, refresher.clone(), PERIOD));

        scheduler.schedule_refresh("alice");
        advance_ticks(3).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_refresh_token_cancels_without_calling_refresher() {
        let sessions = sessions_with_user("alice", None);
        let refresher = Arc::new(CountingRefresher::default());
        let scheduler = Arc::new(TokenRefreshScheduler::new(sessions, refresher.clone(), PERIOD));

        scheduler.schedule_refresh("alice");
        advance_ticks(1).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_scheduled("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn no_live_session_cancels() {
        let sessions = sessions_with_user("alice", Some("rt"));
        sessions.delete_session("s1");
        let refresher = Arc::new(CountingRefresher::default());
        let scheduler = Arc::new(TokenRefreshScheduler::new(sessions, refresher.clone(), PERIOD));

        scheduler.schedule_refresh("alice");
        advance_ticks(1).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_scheduled("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_task() {
        let sessions = sessions_with_user("alice", Some("rt"));
        let refresher = Arc::new(CountingRefresher::default());
        let scheduler = Arc::new(TokenRefreshScheduler::new(sessions, refresher.clone(), PERIOD));

        scheduler.schedule_refresh("alice");
        scheduler.schedule_refresh("alice");
        assert_eq!(scheduler.stats().active_refresh_count, 1);

        advance_ticks(2).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_cancel_all_stop_tasks() {
        let sessions = sessions_with_user("alice", Some("rt"));
        sessions.create_session("s2", Some("bob".into()), None);
        sessions.set_tokens_for_user(
            "bob",
            UserTokens {
                access_token: "at".into(),
                access_token_expiry_ms: i64::MAX,
                refresh_token: Some("rt".into()),
            },
        );
        let refresher = Arc::new(CountingRefresher::default());
        let scheduler = Arc::new(TokenRefreshScheduler::new(sessions, refresher.clone(), PERIOD));

        scheduler.schedule_refresh("bob");
        scheduler.schedule_refresh("alice");
        assert_eq!(
            scheduler.stats(),
            RefreshStats {
                active_refresh_count: 2,
                user_keys: vec!["alice".into(), "bob".into()],
            }
        );

        scheduler.cancel("alice");
        scheduler.cancel("alice");
        assert_eq!(scheduler.stats().user_keys, vec!["bob".to_string()]);

        scheduler.cancel_all();
        advance_ticks(2).await;
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.stats().active_refresh_count, 0);
    }
}
