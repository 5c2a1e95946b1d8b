//! In-memory lock store.
//!
//! Keeps a token index and a path index for live locks. Both indexes are
//! mutated under one writer lock; lookups take the shared side.

use std::collections::{HashMap, HashSet};

use futures_util::{future, FutureExt};
use parking_lot::RwLock;

use crate::davpath::DavPath;
use crate::errors::FsError;
use crate::fs::FsFuture;
use crate::ls::{LockNode, LockStore};

#[derive(Default)]
struct Indexes {
    /// token -> node
    locks: HashMap<String, LockNode>,
    /// path -> tokens rooted there
    paths: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct MemLockStore {
    inner: RwLock<Indexes>,
}

impl MemLockStore {
    pub fn new() -> MemLockStore {
        MemLockStore::default()
    }
}

impl LockStore for MemLockStore {
    fn get<'a>(&'a self, token: &'a str) -> FsFuture<'a, LockNode> {
        let inner = self.inner.read();
        let result = inner.locks.get(token).cloned().ok_or(FsError::NotFound);
        future::ready(result).boxed()
    }

    fn get_by_path<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<LockNode>> {
        let inner = self.inner.read();
        let mut result: Vec<LockNode> = Vec::new();

        // exact roots first, via the path index.
        if let Some(tokens) = inner.paths.get(path.as_str()) {
            for token in tokens {
                if let Some(node) = inner.locks.get(token) {
                    result.push(node.clone());
                }
            }
        }

        // depth-infinity locks rooted at an ancestor.
        for node in inner.locks.values() {
            if node.details.zero_depth {
                continue;
            }
            if node.details.root == *path {
                continue;
            }
            if node.details.root.is_ancestor_of(path)
                && !result.iter().any(|n| n.token == node.token)
            {
                result.push(node.clone());
            }
        }

        future::ready(Ok(result)).boxed()
    }

    fn apply<'a>(&'a self, node: LockNode) -> FsFuture<'a, ()> {
        let mut inner = self.inner.write();
        inner
            .paths
            .entry(node.details.root.as_str().to_string())
            .or_default()
            .insert(node.token.clone());
        inner.locks.insert(node.token.clone(), node);
        future::ready(Ok(())).boxed()
    }

    fn remove<'a>(&'a self, token: &'a str) -> FsFuture<'a, ()> {
        let mut inner = self.inner.write();
        let result = match inner.locks.remove(token) {
            None => Err(FsError::NotFound),
            Some(node) => {
                let root = node.details.root.as_str();
                if let Some(tokens) = inner.paths.get_mut(root) {
                    tokens.remove(token);
                    if tokens.is_empty() {
                        inner.paths.remove(root);
                    }
                }
                Ok(())
            }
        };
        future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ls::LockDetails;
    use std::time::Duration;

    fn node(token: &str, root: &str, zero_depth: bool) -> LockNode {
        LockNode {
            token: token.to_string(),
            details: LockDetails {
                root: DavPath::new(root),
                zero_depth,
                exclusive: true,
                owner_xml: String::new(),
                duration: Duration::ZERO,
            },
            expiry: None,
        }
    }

    #[tokio::test]
    async fn test_indexes_stay_consistent() {
        let store = MemLockStore::new();
        store.apply(node("t1", "/a", false)).await.unwrap();

        assert_eq!(store.get("t1").await.unwrap().token, "t1");
        assert_eq!(store.get_by_path(&DavPath::new("/a")).await.unwrap().len(), 1);

        store.remove("t1").await.unwrap();
        assert_eq!(store.get("t1").await.unwrap_err(), FsError::NotFound);
        assert!(store.get_by_path(&DavPath::new("/a")).await.unwrap().is_empty());
        assert_eq!(store.remove("t1").await.unwrap_err(), FsError::NotFound);
    }

    #[tokio::test]
    async fn test_by_path_includes_infinity_ancestors() {
        let store = MemLockStore::new();
        store.apply(node("deep", "/a", false)).await.unwrap();
        store.apply(node("flat", "/b", true)).await.unwrap();

        let hits = store.get_by_path(&DavPath::new("/a/x/y")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].token, "deep");

        // zero-depth locks never show up below their root
        assert!(store.get_by_path(&DavPath::new("/b/x")).await.unwrap().is_empty());
    }
}
