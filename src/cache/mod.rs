//! Metadata cache middleware.
//!
//! Wraps a backend with a [`CacheStore`] holding stat results and directory
//! listings. Concurrent misses for the same key coalesce into a single
//! upstream call; every mutating operation writes through by invalidating
//! the target entry and the parent's children list; after a directory stat,
//! a detached task pre-populates the listing cache.
//!
//! Errors are never cached: a failed upstream call leaves the store
//! untouched.

pub mod memstore;

use std::io::SeekFrom;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::FsResult;
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};
use crate::middleware::Middleware;
use crate::props::{DavProp, PropPatch, PropStat};
use crate::singleflight;

pub use memstore::MemCacheStore;

/// Storage for cached metadata. The default is [`MemCacheStore`]; external
/// implementations can share entries between processes.
///
/// Entries and children listings are separate families: invalidating a
/// path's entry does not touch its listing and vice versa.
pub trait CacheStore: Send + Sync + 'static {
    fn get<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath)
        -> FsFuture<'a, Option<FileInfo>>;

    fn put<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, info: FileInfo)
        -> FsFuture<'a, ()>;

    fn invalidate<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()>;

    fn get_children<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
    ) -> FsFuture<'a, Option<Vec<FileInfo>>>;

    fn put_children<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        children: Vec<FileInfo>,
    ) -> FsFuture<'a, ()>;

    fn invalidate_children<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath)
        -> FsFuture<'a, ()>;
}

/// The cache-wrapped filesystem.
pub struct CacheFs {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Arc<dyn DavFileSystem>,
    store: Arc<dyn CacheStore>,
    stat_calls: singleflight::Group<DavPath, FileInfo>,
    readdir_calls: singleflight::Group<(DavPath, usize), Vec<FileInfo>>,
}

impl CacheFs {
    pub fn new(backend: Arc<dyn DavFileSystem>, store: Arc<dyn CacheStore>) -> Arc<CacheFs> {
        Arc::new(CacheFs {
            inner: Arc::new(CacheInner {
                backend,
                store,
                stat_calls: singleflight::Group::new(),
                readdir_calls: singleflight::Group::new(),
            }),
        })
    }
}

/// Middleware wiring a cache store into a filesystem chain.
pub fn middleware(store: Arc<dyn CacheStore>) -> Middleware {
    Box::new(move |next| CacheFs::new(next, store.clone()))
}

impl CacheInner {
    /// Drop the cached entry for `path` and the children listing of its
    /// parent. Called before every mutation and after every written close.
    async fn invalidate_with_parent(&self, ctx: &DavContext, path: &DavPath) -> FsResult<()> {
        self.store.invalidate(ctx, path).await?;
        if path.is_root() {
            return Ok(());
        }
        self.store.invalidate_children(ctx, &path.parent()).await
    }

    async fn stat(self: &Arc<Self>, ctx: &DavContext, path: &DavPath) -> FsResult<FileInfo> {
        if let Some(info) = self.store.get(ctx, path).await? {
            debug!("cache: stat hit {path}");
            return Ok(info);
        }
        debug!("cache: stat miss {path}");

        let info = {
            let backend = self.backend.clone();
            let ctx = ctx.clone();
            let path = path.clone();
            self.stat_calls
                .run(path.clone(), async move { backend.metadata(&ctx, &path).await })
                .await?
        };

        self.store.put(ctx, path, info.clone()).await?;

        if info.is_dir {
            // pre-populate the listing cache in the background; this task
            // must survive cancellation of the originating request.
            let this = self.clone();
            let path = path.clone();
            let bg = ctx.detach();
            tokio::spawn(async move {
                debug!("cache: pre-populating directory listing of {path}");
                if let Err(err) = this.read_dir_cached(&bg, &path, 0).await {
                    error!("cache: could not pre-populate listing of {path}: {err}");
                }
            });
        }

        Ok(info)
    }

    /// Cached `read_dir`. Partial listings (`count > 0`) always go
    /// upstream; only full listings are cached.
    async fn read_dir_cached(
        self: &Arc<Self>,
        ctx: &DavContext,
        path: &DavPath,
        count: usize,
    ) -> FsResult<Vec<FileInfo>> {
        let this = self.clone();
        let ctx = ctx.clone();
        let path_key = path.clone();
        self.readdir_calls
            .run((path.clone(), count), async move {
                let path = path_key;
                if count > 0 {
                    return this.read_dir_upstream(&ctx, &path, count).await;
                }

                if let Some(children) = this.store.get_children(&ctx, &path).await? {
                    debug!("cache: children hit {path}");
                    return Ok(children);
                }
                debug!("cache: children miss {path}");

                let children = this.read_dir_upstream(&ctx, &path, 0).await?;
                this.store.put_children(&ctx, &path, children.clone()).await?;
                for child in &children {
                    let full = path.join(&child.name);
                    this.store.put(&ctx, &full, child.clone()).await?;
                }
                Ok(children)
            })
            .await
    }

    async fn read_dir_upstream(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        count: usize,
    ) -> FsResult<Vec<FileInfo>> {
        let mut dir = self.backend.open(ctx, path, OpenFlags::READ, 0).await?;
        let listed = dir.read_dir(count).await;
        let closed = dir.close().await;
        let children = listed?;
        closed?;
        Ok(children)
    }
}

impl DavFileSystem for CacheFs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()> {
        async move {
            self.inner.invalidate_with_parent(ctx, path).await?;
            self.inner.backend.mkdir(ctx, path, mode).await
        }
        .boxed()
    }

    fn open<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        flags: OpenFlags,
        mode: u32,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        async move {
            let is_write = flags.is_write();
            if is_write {
                self.inner.invalidate_with_parent(ctx, path).await?;
            }
            let file = self.inner.backend.open(ctx, path, flags, mode).await?;
            Ok(Box::new(CacheFile {
                inner: self.inner.clone(),
                ctx: ctx.clone(),
                path: path.clone(),
                file,
                is_write,
            }) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            self.inner.invalidate_with_parent(ctx, path).await?;
            self.inner.backend.remove_all(ctx, path).await
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
            self.inner.invalidate_with_parent(ctx, from).await?;
            self.inner.invalidate_with_parent(ctx, to).await?;
            self.inner.backend.rename(ctx, from, to).await
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        async move { self.inner.stat(ctx, path).await }.boxed()
    }

    fn get_props<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        self.inner.backend.get_props(ctx, path)
    }

    fn patch_props<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        patches: Vec<PropPatch>,
    ) -> FsFuture<'a, Vec<PropStat>> {
        self.inner.backend.patch_props(ctx, path, patches)
    }
}

/// File wrapper that serves cached metadata/listings and remembers whether
/// the handle was opened for write, to invalidate on close.
struct CacheFile {
    inner: Arc<CacheInner>,
    ctx: DavContext,
    path: DavPath,
    file: Box<dyn DavFile>,
    is_write: bool,
}

impl DavFile for CacheFile {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, FileInfo> {
        async move {
            if let Some(info) = self.inner.store.get(&self.ctx, &self.path).await? {
                debug!("cache: file stat hit {}", self.path);
                return Ok(info);
            }
            let info = self.file.metadata().await?;
            self.inner.store.put(&self.ctx, &self.path, info.clone()).await?;
            Ok(info)
        }
        .boxed()
    }

    fn read_bytes<'a>(&'a mut self, count: usize) -> FsFuture<'a, Bytes> {
        self.file.read_bytes(count)
    }

    fn write_bytes<'a>(&'a mut self, buf: Bytes) -> FsFuture<'a, ()> {
        self.file.write_bytes(buf)
    }

    fn seek<'a>(&'a mut self, pos: SeekFrom) -> FsFuture<'a, u64> {
        self.file.seek(pos)
    }

    fn read_dir<'a>(&'a mut self, count: usize) -> FsFuture<'a, Vec<FileInfo>> {
        async move { self.inner.read_dir_cached(&self.ctx, &self.path, count).await }.boxed()
    }

    fn close<'a>(&'a mut self) -> FsFuture<'a, ()> {
        async move {
            let mut invalidate_result = Ok(());
            if self.is_write {
                invalidate_result = self
                    .inner
                    .invalidate_with_parent(&self.ctx, &self.path)
                    .await;
            }

            let close_result = self.file.close().await;

            // a failed invalidation matters more than a failed close: a
            // stale entry would keep serving the old metadata.
            invalidate_result?;
            close_result
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::localfs::LocalFs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Wrapper counting upstream calls.
    struct CountingFs {
        backend: Arc<dyn DavFileSystem>,
        stats: AtomicUsize,
        opens: AtomicUsize,
    }

    impl CountingFs {
        fn new(backend: Arc<dyn DavFileSystem>) -> Arc<CountingFs> {
            Arc::new(CountingFs {
                backend,
                stats: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
            })
        }
    }

    impl DavFileSystem for CountingFs {
        fn mkdir<'a>(
            &'a self,
            ctx: &'a DavContext,
            path: &'a DavPath,
            mode: u32,
        ) -> FsFuture<'a, ()> {
            self.backend.mkdir(ctx, path, mode)
        }

        fn open<'a>(
            &'a self,
            ctx: &'a DavContext,
            path: &'a DavPath,
            flags: OpenFlags,
            mode: u32,
        ) -> FsFuture<'a, Box<dyn DavFile>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.backend.open(ctx, path, flags, mode)
        }

        fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
            self.backend.remove_all(ctx, path)
        }

        fn rename<'a>(
            &'a self,
            ctx: &'a DavContext,
            from: &'a DavPath,
            to: &'a DavPath,
        ) -> FsFuture<'a, ()> {
            self.backend.rename(ctx, from, to)
        }

        fn metadata<'a>(
            &'a self,
            ctx: &'a DavContext,
            path: &'a DavPath,
        ) -> FsFuture<'a, FileInfo> {
            self.stats.fetch_add(1, Ordering::SeqCst);
            self.backend.metadata(ctx, path)
        }
    }

    fn setup(dir: &std::path::Path) -> (Arc<CountingFs>, Arc<CacheFs>) {
        let counting = CountingFs::new(LocalFs::new(dir));
        let cache = CacheFs::new(counting.clone(), MemCacheStore::new(Duration::from_secs(60)));
        (counting, cache)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_concurrent_stats_hit_upstream_once() {
        let dir = tempfile::tempdir().unwrap();
        let (counting, cache) = setup(dir.path());
        let ctx = DavContext::background();
        let path = DavPath::new("/p");
        cache.mkdir(&ctx, &path, 0o755).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let ctx = ctx.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                cache.metadata(&ctx, &path).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().is_dir);
        }

        assert_eq!(counting.stats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_write_close_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let (_counting, cache) = setup(dir.path());
        let ctx = DavContext::background();
        let path = DavPath::new("/f.txt");

        // seed the cache with the initial (empty) file
        let mut f = cache
            .open(&ctx, &path, OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE, 0o644)
            .await
            .unwrap();
        f.close().await.unwrap();
        assert_eq!(cache.metadata(&ctx, &path).await.unwrap().size, 0);

        let mut f = cache
            .open(&ctx, &path, OpenFlags::WRITE | OpenFlags::TRUNCATE, 0o644)
            .await
            .unwrap();
        f.write_bytes(Bytes::from_static(b"hello")).await.unwrap();
        f.close().await.unwrap();

        // the cached size must not survive the written close
        assert_eq!(cache.metadata(&ctx, &path).await.unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_readdir_sees_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (_counting, cache) = setup(dir.path());
        let ctx = DavContext::background();

        cache.mkdir(&ctx, &DavPath::new("/d"), 0o755).await.unwrap();

        // cache the (empty) listing
        let mut d = cache
            .open(&ctx, &DavPath::new("/d"), OpenFlags::READ, 0)
            .await
            .unwrap();
        assert!(d.read_dir(0).await.unwrap().is_empty());
        d.close().await.unwrap();

        let path = DavPath::new("/d/child.txt");
        let mut f = cache
            .open(&ctx, &path, OpenFlags::WRITE | OpenFlags::CREATE, 0o644)
            .await
            .unwrap();
        f.write_bytes(Bytes::from_static(b"abc")).await.unwrap();
        f.close().await.unwrap();

        let mut d = cache
            .open(&ctx, &DavPath::new("/d"), OpenFlags::READ, 0)
            .await
            .unwrap();
        let children = d.read_dir(0).await.unwrap();
        d.close().await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "child.txt");
        assert_eq!(children[0].size, 3);

        // the listing also populated the child's stat entry
        assert_eq!(cache.metadata(&ctx, &path).await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (counting, cache) = setup(dir.path());
        let ctx = DavContext::background();
        let path = DavPath::new("/ghost");

        assert!(cache.metadata(&ctx, &path).await.is_err());
        assert!(cache.metadata(&ctx, &path).await.is_err());
        // both misses went upstream: the error was never stored
        assert_eq!(counting.stats.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rename_invalidates_both_parents() {
        let dir = tempfile::tempdir().unwrap();
        let (_counting, cache) = setup(dir.path());
        let ctx = DavContext::background();

        cache.mkdir(&ctx, &DavPath::new("/src"), 0o755).await.unwrap();
        cache.mkdir(&ctx, &DavPath::new("/dst"), 0o755).await.unwrap();
        let old = DavPath::new("/src/f");
        let new = DavPath::new("/dst/f");
        let mut f = cache
            .open(&ctx, &old, OpenFlags::WRITE | OpenFlags::CREATE, 0o644)
            .await
            .unwrap();
        f.write_bytes(Bytes::from_static(b"x")).await.unwrap();
        f.close().await.unwrap();

        // warm both listings
        for p in ["/src", "/dst"] {
            let mut d = cache
                .open(&ctx, &DavPath::new(p), OpenFlags::READ, 0)
                .await
                .unwrap();
            d.read_dir(0).await.unwrap();
            d.close().await.unwrap();
        }

        cache.rename(&ctx, &old, &new).await.unwrap();

        let mut d = cache
            .open(&ctx, &DavPath::new("/src"), OpenFlags::READ, 0)
            .await
            .unwrap();
        assert!(d.read_dir(0).await.unwrap().is_empty());
        d.close().await.unwrap();

        let mut d = cache
            .open(&ctx, &DavPath::new("/dst"), OpenFlags::READ, 0)
            .await
            .unwrap();
        assert_eq!(d.read_dir(0).await.unwrap().len(), 1);
        d.close().await.unwrap();
    }
}
