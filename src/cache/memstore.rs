//! In-memory TTL cache store.
//!
//! Entries expire lazily on read and eagerly through a background sweeper
//! that runs at twice the TTL. The sweeper holds a weak reference, so
//! dropping the store stops it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{future, FutureExt};
use parking_lot::Mutex;

use crate::cache::CacheStore;
use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::fs::{FileInfo, FsFuture};

struct Entry {
    info: FileInfo,
    expires: Instant,
}

struct ChildrenEntry {
    children: Vec<FileInfo>,
    expires: Instant,
}

pub struct MemCacheStore {
    ttl: Duration,
    items: Mutex<HashMap<String, Entry>>,
    children: Mutex<HashMap<String, ChildrenEntry>>,
}

impl MemCacheStore {
    /// Create a store with the given entry TTL and start its sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(ttl: Duration) -> Arc<MemCacheStore> {
        let store = Arc::new(MemCacheStore {
            ttl,
            items: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl * 2);
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                store.sweep(Instant::now());
            }
        });

        store
    }

    fn sweep(&self, now: Instant) {
        self.items.lock().retain(|_, entry| entry.expires > now);
        self.children.lock().retain(|_, entry| entry.expires > now);
    }
}

impl CacheStore for MemCacheStore {
    fn get<'a>(
        &'a self,
        _ctx: &'a DavContext,
        path: &'a DavPath,
    ) -> FsFuture<'a, Option<FileInfo>> {
        let mut items = self.items.lock();
        let result = match items.get(path.as_str()) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.info.clone()),
            Some(_) => {
                items.remove(path.as_str());
                None
            }
            None => None,
        };
        future::ready(Ok(result)).boxed()
    }

    fn put<'a>(
        &'a self,
        _ctx: &'a DavContext,
        path: &'a DavPath,
        info: FileInfo,
    ) -> FsFuture<'a, ()> {
        self.items.lock().insert(
            path.as_str().to_string(),
            Entry {
                info,
                expires: Instant::now() + self.ttl,
            },
        );
        future::ready(Ok(())).boxed()
    }

    fn invalidate<'a>(&'a self, _ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        self.items.lock().remove(path.as_str());
        future::ready(Ok(())).boxed()
    }

    fn get_children<'a>(
        &'a self,
        _ctx: &'a DavContext,
        path: &'a DavPath,
    ) -> FsFuture<'a, Option<Vec<FileInfo>>> {
        let mut children = self.children.lock();
        let result = match children.get(path.as_str()) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.children.clone()),
            Some(_) => {
                children.remove(path.as_str());
                None
            }
            None => None,
        };
        future::ready(Ok(result)).boxed()
    }

    fn put_children<'a>(
        &'a self,
        _ctx: &'a DavContext,
        path: &'a DavPath,
        children: Vec<FileInfo>,
    ) -> FsFuture<'a, ()> {
        self.children.lock().insert(
            path.as_str().to_string(),
            ChildrenEntry {
                children,
                expires: Instant::now() + self.ttl,
            },
        );
        future::ready(Ok(())).boxed()
    }

    fn invalidate_children<'a>(
        &'a self,
        _ctx: &'a DavContext,
        path: &'a DavPath,
    ) -> FsFuture<'a, ()> {
        self.children.lock().remove(path.as_str());
        future::ready(Ok(())).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn info(name: &str, size: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size,
            mode: 0o644,
            modified: UNIX_EPOCH,
            is_dir: false,
        }
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_lazy() {
        let store = MemCacheStore::new(Duration::from_millis(20));
        let ctx = DavContext::background();
        let path = DavPath::new("/x");

        store.put(&ctx, &path, info("x", 1)).await.unwrap();
        assert!(store.get(&ctx, &path).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get(&ctx, &path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweeper_runs_at_twice_ttl() {
        let store = MemCacheStore::new(Duration::from_millis(20));
        let ctx = DavContext::background();
        store.put(&ctx, &DavPath::new("/y"), info("y", 1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // the sweeper removed the entry without a read touching it
        assert!(store.items.lock().is_empty());
    }

    #[tokio::test]
    async fn test_entry_and_children_are_separate() {
        let store = MemCacheStore::new(Duration::from_secs(60));
        let ctx = DavContext::background();
        let path = DavPath::new("/d");

        store.put(&ctx, &path, info("d", 0)).await.unwrap();
        store
            .put_children(&ctx, &path, vec![info("a", 1)])
            .await
            .unwrap();

        store.invalidate(&ctx, &path).await.unwrap();
        assert!(store.get(&ctx, &path).await.unwrap().is_none());
        assert!(store.get_children(&ctx, &path).await.unwrap().is_some());

        store.invalidate_children(&ctx, &path).await.unwrap();
        assert!(store.get_children(&ctx, &path).await.unwrap().is_none());
    }
}
