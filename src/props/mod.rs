//! Dead properties.
//!
//! A dead property is a WebDAV property whose value the server stores
//! verbatim without interpretation. Properties live in a [`DeadPropStore`]
//! keyed by path, outside the storage backend; the [`DeadPropsFs`]
//! middleware keeps the store consistent with renames and removals and
//! serves `get_props`/`patch_props` on the filesystem contract.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{future, FutureExt};
use http::StatusCode;
use parking_lot::RwLock;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};
use crate::middleware::Middleware;

/// An XML qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QName {
    pub ns: String,
    pub local: String,
}

impl QName {
    pub fn new(ns: impl Into<String>, local: impl Into<String>) -> QName {
        QName {
            ns: ns.into(),
            local: local.into(),
        }
    }

    /// A name in the `DAV:` namespace.
    pub fn dav(local: impl Into<String>) -> QName {
        QName::new("DAV:", local)
    }
}

/// A single property: qualified name, raw XML value, optional language tag.
#[derive(Debug, Clone, PartialEq)]
pub struct DavProp {
    pub name: QName,
    pub lang: Option<String>,
    pub xml: String,
}

/// One PROPPATCH instruction: set or remove a group of properties.
#[derive(Debug, Clone)]
pub struct PropPatch {
    pub remove: bool,
    pub props: Vec<DavProp>,
}

/// The per-instruction outcome, one HTTP status for a group of properties.
#[derive(Debug, Clone)]
pub struct PropStat {
    pub status: StatusCode,
    pub props: Vec<DavProp>,
}

/// Storage for dead properties. The default is in-memory; external
/// implementations can persist them elsewhere.
pub trait DeadPropStore: Send + Sync + 'static {
    fn get<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>>;

    /// Apply patches in order, emitting one [`PropStat`] per patch.
    fn patch<'a>(&'a self, path: &'a DavPath, patches: Vec<PropPatch>)
        -> FsFuture<'a, Vec<PropStat>>;

    /// Drop the properties of `path` and all its descendants.
    fn remove_all<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Move the properties of `path` and all its descendants.
    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()>;
}

/// In-memory dead property store.
pub struct MemPropStore {
    props: RwLock<HashMap<String, HashMap<QName, DavProp>>>,
}

impl MemPropStore {
    pub fn new() -> Arc<MemPropStore> {
        Arc::new(MemPropStore {
            props: RwLock::new(HashMap::new()),
        })
    }
}

impl DeadPropStore for MemPropStore {
    fn get<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        let props = self.props.read();
        let result = props
            .get(path.as_str())
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        future::ready(Ok(result)).boxed()
    }

    fn patch<'a>(
        &'a self,
        path: &'a DavPath,
        patches: Vec<PropPatch>,
    ) -> FsFuture<'a, Vec<PropStat>> {
        let mut all = self.props.write();
        let props = all.entry(path.as_str().to_string()).or_default();

        let mut propstats = Vec::new();
        for patch in patches {
            let mut done = Vec::new();
            if patch.remove {
                for prop in patch.props {
                    props.remove(&prop.name);
                    // report the name only, the value is gone.
                    done.push(DavProp {
                        name: prop.name,
                        lang: None,
                        xml: String::new(),
                    });
                }
            } else {
                for prop in patch.props {
                    props.insert(prop.name.clone(), prop.clone());
                    done.push(prop);
                }
            }
            if !done.is_empty() {
                propstats.push(PropStat {
                    status: StatusCode::OK,
                    props: done,
                });
            }
        }
        future::ready(Ok(propstats)).boxed()
    }

    fn remove_all<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let mut props = self.props.write();
        props.remove(path.as_str());
        let prefix = format!("{}/", path.as_str().trim_end_matches('/'));
        props.retain(|key, _| !key.starts_with(&prefix));
        future::ready(Ok(())).boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        let mut props = self.props.write();
        let prefix = format!("{}/", from.as_str().trim_end_matches('/'));

        // collect first, then apply, so overlapping old/new trees can't
        // observe a half-moved state.
        let mut moves = Vec::new();
        let mut deletes = Vec::new();
        for (key, value) in props.iter() {
            if key == from.as_str() {
                moves.push((to.as_str().to_string(), value.clone()));
                deletes.push(key.clone());
            } else if let Some(suffix) = key.strip_prefix(&prefix) {
                moves.push((format!("{}/{}", to.as_str(), suffix), value.clone()));
                deletes.push(key.clone());
            }
        }
        for key in deletes {
            props.remove(&key);
        }
        for (key, value) in moves {
            props.insert(key, value);
        }
        future::ready(Ok(())).boxed()
    }
}

/// Filesystem wrapper that keeps a [`DeadPropStore`] in sync with the
/// backend and exposes it through the prop methods of the contract.
pub struct DeadPropsFs {
    backend: Arc<dyn DavFileSystem>,
    store: Arc<dyn DeadPropStore>,
}

impl DeadPropsFs {
    pub fn new(backend: Arc<dyn DavFileSystem>, store: Arc<dyn DeadPropStore>) -> Arc<DeadPropsFs> {
        Arc::new(DeadPropsFs { backend, store })
    }
}

/// Middleware wiring a dead-prop store into a filesystem chain.
pub fn middleware(store: Arc<dyn DeadPropStore>) -> Middleware {
    Box::new(move |next| DeadPropsFs::new(next, store.clone()))
}

impl DavFileSystem for DeadPropsFs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()> {
        self.backend.mkdir(ctx, path, mode)
    }

    fn open<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        flags: OpenFlags,
        mode: u32,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        self.backend.open(ctx, path, flags, mode)
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            self.backend.remove_all(ctx, path).await?;
            self.store.remove_all(path).await
        }
        .boxed()
    }

    fn rename<'a>(
        &'a self,
        ctx: &'a DavContext,
        from: &'a DavPath,
        to: &'a DavPath,
    ) -> FsFuture<'a, ()> {
        async move {
            self.backend.rename(ctx, from, to).await?;
            self.store.rename(from, to).await
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        self.backend.metadata(ctx, path)
    }

    fn get_props<'a>(&'a self, _ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        self.store.get(path)
    }

    fn patch_props<'a>(
        &'a self,
        _ctx: &'a DavContext,
        path: &'a DavPath,
        patches: Vec<PropPatch>,
    ) -> FsFuture<'a, Vec<PropStat>> {
        self.store.patch(path, patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prop(local: &str, value: &str) -> DavProp {
        DavProp {
            name: QName::dav(local),
            lang: None,
            xml: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_patch_set_and_remove() {
        let store = MemPropStore::new();
        let path = DavPath::new("/doc.txt");

        let stats = store
            .patch(
                &path,
                vec![PropPatch {
                    remove: false,
                    props: vec![prop("author", "<D:author>jo</D:author>")],
                }],
            )
            .await
            .unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].status, StatusCode::OK);

        let got = store.get(&path).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].xml, "<D:author>jo</D:author>");

        store
            .patch(
                &path,
                vec![PropPatch {
                    remove: true,
                    props: vec![prop("author", "")],
                }],
            )
            .await
            .unwrap();
        assert!(store.get(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_descendants() {
        let store = MemPropStore::new();
        let dir = DavPath::new("/a");
        let child = DavPath::new("/a/b/c.txt");
        for p in [&dir, &child] {
            store
                .patch(
                    p,
                    vec![PropPatch {
                        remove: false,
                        props: vec![prop("tag", "<t/>")],
                    }],
                )
                .await
                .unwrap();
        }

        store.rename(&dir, &DavPath::new("/z")).await.unwrap();

        assert!(store.get(&dir).await.unwrap().is_empty());
        assert!(store.get(&child).await.unwrap().is_empty());
        assert_eq!(store.get(&DavPath::new("/z")).await.unwrap().len(), 1);
        assert_eq!(store.get(&DavPath::new("/z/b/c.txt")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_is_recursive() {
        let store = MemPropStore::new();
        let dir = DavPath::new("/a");
        let child = DavPath::new("/a/b.txt");
        let sibling = DavPath::new("/ab.txt");
        for p in [&dir, &child, &sibling] {
            store
                .patch(
                    p,
                    vec![PropPatch {
                        remove: false,
                        props: vec![prop("tag", "<t/>")],
                    }],
                )
                .await
                .unwrap();
        }

        store.remove_all(&dir).await.unwrap();

        assert!(store.get(&dir).await.unwrap().is_empty());
        assert!(store.get(&child).await.unwrap().is_empty());
        // "/ab.txt" is not below "/a"
        assert_eq!(store.get(&sibling).await.unwrap().len(), 1);
    }
}
