//! Duplicate-call suppression.
//!
//! A [`Group`] coalesces concurrent calls for the same key: the first caller
//! runs the supplied future, every other caller that arrives while it is in
//! flight awaits the same shared result. The cache middleware uses one group
//! per upstream operation to prevent stat/readdir stampedes.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::errors::FsError;

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, FsError>>>;

pub struct Group<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    calls: Mutex<HashMap<K, SharedCall<T>>>,
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Group<K, T> {
        Group {
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Run `fut` under `key`, sharing its result with concurrent callers.
    pub async fn run<F>(&self, key: K, fut: F) -> Result<T, FsError>
    where
        F: Future<Output = Result<T, FsError>> + Send + 'static,
    {
        let (call, leader) = {
            let mut calls = self.calls.lock();
            if let Some(existing) = calls.get(&key) {
                (existing.clone(), false)
            } else {
                let shared = fut.boxed().shared();
                calls.insert(key.clone(), shared.clone());
                (shared, true)
            }
        };

        let result = call.await;

        if leader {
            self.calls.lock().remove(&key);
        }

        result
    }
}

impl<K, T> Default for Group<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Group::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_coalesces_concurrent_calls() {
        let group = Arc::new(Group::<String, u64>::new());
        let upstream = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let group = group.clone();
            let upstream = upstream.clone();
            tasks.push(tokio::spawn(async move {
                group
                    .run("key".to_string(), async move {
                        upstream.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(upstream.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_errors_are_shared_not_cached() {
        let group = Arc::new(Group::<&'static str, u64>::new());

        let err = group
            .run("k", async { Err::<u64, _>(FsError::NotFound) })
            .await;
        assert_eq!(err, Err(FsError::NotFound));

        // the failed call is gone; the next call runs again
        let ok = group.run("k", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }
}
