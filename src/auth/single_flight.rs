//! Keyed single-flight execution.
//!
//! Concurrent callers using the same key share one in-flight future and all
//! receive a clone of its result. The entry is removed once the future
//! completes, so the next call after completion starts a fresh one.

use std::future::Future;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Deduplicates concurrent work per key
pub struct SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inflight: DashMap<String, SharedResult<T, E>>,
}

impl<T, E> Default for SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless a run is already in flight, in which
    /// case wait for that one instead.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let shared = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(e) => e.get().clone(),
            Entry::Vacant(v) => {
                let fut = make().boxed().shared();
                v.insert(fut.clone());
                fut
            }
        };

        let result = shared.clone().await;
        self.inflight.remove_if(key, |_, f| f.ptr_eq(&shared));
        result
    }

    /// Keys with a run in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let group: Arc<SingleFlight<u32, String>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                group
                    .run("alice", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(7));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let group: SingleFlight<&'static str, String> = SingleFlight::new();
        let (a, b) = tokio::join!(
            group.run("alice", || async { Ok("a") }),
            group.run("bob", || async { Ok("b") }),
        );
        assert_eq!(a, Ok("a"));
        assert_eq!(b, Ok("b"));
    }

    #[tokio::test]
    async fn errors_are_shared_and_not_cached() {
        let group: SingleFlight<u32, String> = SingleFlight::new();
        let first = group.run("k", || async { Err("rejected".to_string()) }).await;
        assert_eq!(first, Err("rejected".to_string()));
        let second = group.run("k", || async { Ok(1) }).await;
        assert_eq!(second, Ok(1));
    }
}
