//
// This module contains the composition root of the library, DavHandler.
//
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::FutureExt;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};
use crate::ls::{Condition, LockDetails, LockRelease, LockSystem};
use crate::middleware::{chain, Middleware};
use crate::props::{DavProp, PropPatch, PropStat};
use crate::util::DavMethod;

// copy buffer for COPY, which streams through the filesystem contract.
const COPY_BUF_SIZE: usize = 65536;

/// Configuration of the handler.
pub struct DavBuilder {
    /// Storage backend, the leaf of the middleware chain.
    fs: Arc<dyn DavFileSystem>,
    /// Middlewares, outermost first.
    middlewares: Vec<Middleware>,
    /// Lock system; without one, lock verbs fail and confirmation is a
    /// no-op.
    ls: Option<LockSystem>,
    /// Set of allowed methods (defaults to "all methods").
    allow: DavMethod,
    /// Principal is webdav speak for "user", used to give locks an owner.
    principal: Option<String>,
}

impl DavBuilder {
    /// Create a new configuration builder around a backend.
    pub fn new(fs: Arc<dyn DavFileSystem>) -> DavBuilder {
        DavBuilder {
            fs,
            middlewares: Vec::new(),
            ls: None,
            allow: DavMethod::WEBDAV_RW,
            principal: None,
        }
    }

    /// Add a middleware. The first one added becomes the outermost wrapper.
    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Set the locksystem to use.
    pub fn locksystem(mut self, ls: LockSystem) -> Self {
        self.ls = Some(ls);
        self
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(mut self, allow: DavMethod) -> Self {
        self.allow = allow;
        self
    }

    /// Set the name of the "webdav principal". This will be the owner of
    /// any created locks that do not carry one.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Use the configuration that was built to generate a DavHandler.
    pub fn build(self) -> DavHandler {
        DavHandler {
            fs: chain(self.fs, self.middlewares),
            ls: self.ls.map(Arc::new),
            allow: self.allow,
            principal: self.principal.map(Arc::new),
        }
    }
}

/// The webdav core handler.
///
/// Composes the storage backend, the middleware chain and the lock system
/// behind one filesystem handle and routes each WebDAV verb to it. The
/// protocol handler parses the XML framing, then calls one typed method per
/// verb; every mutating verb passes the client's condition list through
/// [`LockSystem::confirm`] before the filesystem chain is invoked.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) fs: Arc<dyn DavFileSystem>,
    pub(crate) ls: Option<Arc<LockSystem>>,
    pub(crate) allow: DavMethod,
    pub(crate) principal: Option<Arc<String>>,
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder(fs: Arc<dyn DavFileSystem>) -> DavBuilder {
        DavBuilder::new(fs)
    }

    /// The composed filesystem chain.
    pub fn filesystem(&self) -> &Arc<dyn DavFileSystem> {
        &self.fs
    }

    /// The lock system, if one is configured.
    pub fn locksystem(&self) -> Option<&Arc<LockSystem>> {
        self.ls.as_ref()
    }

    fn allowed(&self, method: DavMethod) -> FsResult<()> {
        if self.allow.contains(method) {
            Ok(())
        } else {
            debug!("dav: method {method:?} not allowed");
            Err(FsError::Forbidden)
        }
    }

    /// Check the condition list against held locks before a mutation.
    async fn confirm(
        &self,
        src: &DavPath,
        dst: Option<&DavPath>,
        conditions: &[Condition],
    ) -> FsResult<Option<LockRelease>> {
        match &self.ls {
            None => Ok(None),
            Some(ls) => ls
                .confirm(SystemTime::now(), src, dst, conditions)
                .await
                .map(Some),
        }
    }

    /// GET/HEAD: open for reading.
    pub async fn get(&self, ctx: &DavContext, path: &DavPath) -> FsResult<Box<dyn DavFile>> {
        self.allowed(DavMethod::GET)?;
        self.fs.open(ctx, path, OpenFlags::READ, 0).await
    }

    /// PUT: open for writing, creating and truncating.
    pub async fn put(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        conditions: &[Condition],
    ) -> FsResult<Box<dyn DavFile>> {
        self.allowed(DavMethod::PUT)?;
        self.confirm(path, None, conditions).await?;
        self.fs
            .open(
                ctx,
                path,
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
            )
            .await
    }

    /// MKCOL.
    pub async fn mkcol(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        conditions: &[Condition],
    ) -> FsResult<()> {
        self.allowed(DavMethod::MKCOL)?;
        self.confirm(path, None, conditions).await?;
        self.fs.mkdir(ctx, path, 0o755).await
    }

    /// DELETE: recursive, idempotent remove.
    pub async fn delete(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        conditions: &[Condition],
    ) -> FsResult<()> {
        self.allowed(DavMethod::DELETE)?;
        self.confirm(path, None, conditions).await?;
        self.fs.remove_all(ctx, path).await
    }

    /// MOVE.
    pub async fn rename(
        &self,
        ctx: &DavContext,
        from: &DavPath,
        to: &DavPath,
        conditions: &[Condition],
    ) -> FsResult<()> {
        self.allowed(DavMethod::MOVE)?;
        self.confirm(from, Some(to), conditions).await?;
        self.fs.rename(ctx, from, to).await
    }

    /// COPY: recursive copy through the filesystem contract, which has no
    /// native copy operation. Only the destination needs lock confirmation;
    /// the source is read, not mutated.
    pub async fn copy(
        &self,
        ctx: &DavContext,
        from: &DavPath,
        to: &DavPath,
        conditions: &[Condition],
    ) -> FsResult<()> {
        self.allowed(DavMethod::COPY)?;
        self.confirm(to, None, conditions).await?;
        self.copy_tree(ctx, from.clone(), to.clone()).await
    }

    fn copy_tree<'a>(&'a self, ctx: &'a DavContext, from: DavPath, to: DavPath) -> FsFuture<'a, ()> {
        async move {
            let info = self.fs.metadata(ctx, &from).await?;
            if info.is_dir {
                match self.fs.mkdir(ctx, &to, 0o755).await {
                    Ok(()) | Err(FsError::Exists) => {}
                    Err(err) => return Err(err),
                }
                let children = {
                    let mut dir = self.fs.open(ctx, &from, OpenFlags::READ, 0).await?;
                    let children = dir.read_dir(0).await;
                    dir.close().await?;
                    children?
                };
                for child in children {
                    self.copy_tree(ctx, from.join(&child.name), to.join(&child.name))
                        .await?;
                }
                return Ok(());
            }

            let mut src = self.fs.open(ctx, &from, OpenFlags::READ, 0).await?;
            let mut dst = match self
                .fs
                .open(
                    ctx,
                    &to,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    info.mode,
                )
                .await
            {
                Ok(dst) => dst,
                Err(err) => {
                    let _ = src.close().await;
                    return Err(err);
                }
            };

            let result: FsResult<()> = async {
                loop {
                    ctx.check_cancelled()?;
                    let buf = src.read_bytes(COPY_BUF_SIZE).await?;
                    if buf.is_empty() {
                        break;
                    }
                    dst.write_bytes(buf).await?;
                }
                Ok(())
            }
            .await;

            let src_close = src.close().await;
            let dst_close = dst.close().await;
            result?;
            src_close?;
            dst_close
        }
        .boxed()
    }

    /// PROPFIND, depth 0: the entry itself.
    pub async fn stat(&self, ctx: &DavContext, path: &DavPath) -> FsResult<FileInfo> {
        self.allowed(DavMethod::PROPFIND)?;
        self.fs.metadata(ctx, path).await
    }

    /// PROPFIND, depth 1: the direct children.
    pub async fn list(&self, ctx: &DavContext, path: &DavPath) -> FsResult<Vec<FileInfo>> {
        self.allowed(DavMethod::PROPFIND)?;
        let mut dir = self.fs.open(ctx, path, OpenFlags::READ, 0).await?;
        let children = dir.read_dir(0).await;
        dir.close().await?;
        children
    }

    /// PROPFIND: the dead properties of the entry.
    pub async fn get_props(&self, ctx: &DavContext, path: &DavPath) -> FsResult<Vec<DavProp>> {
        self.allowed(DavMethod::PROPFIND)?;
        self.fs.get_props(ctx, path).await
    }

    /// PROPPATCH.
    pub async fn patch_props(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        patches: Vec<PropPatch>,
        conditions: &[Condition],
    ) -> FsResult<Vec<PropStat>> {
        self.allowed(DavMethod::PROPPATCH)?;
        self.confirm(path, None, conditions).await?;
        self.fs.patch_props(ctx, path, patches).await
    }

    /// LOCK: create a new lock, returning its token.
    ///
    /// Locks without an owner element are attributed to the configured
    /// principal.
    pub async fn lock(&self, mut details: LockDetails) -> FsResult<String> {
        self.allowed(DavMethod::LOCK)?;
        let Some(ls) = &self.ls else {
            return Err(FsError::NotImplemented);
        };
        if details.owner_xml.is_empty() {
            if let Some(principal) = &self.principal {
                details.owner_xml = format!("<D:owner>{principal}</D:owner>");
            }
        }
        ls.create(SystemTime::now(), details).await
    }

    /// LOCK with a token: refresh an existing lock.
    pub async fn refresh_lock(&self, token: &str, duration: Duration) -> FsResult<LockDetails> {
        self.allowed(DavMethod::LOCK)?;
        let Some(ls) = &self.ls else {
            return Err(FsError::NotImplemented);
        };
        ls.refresh(SystemTime::now(), token, duration).await
    }

    /// UNLOCK.
    pub async fn unlock(&self, token: &str) -> FsResult<()> {
        self.allowed(DavMethod::UNLOCK)?;
        let Some(ls) = &self.ls else {
            return Err(FsError::NotImplemented);
        };
        ls.unlock(SystemTime::now(), token).await
    }

    /// Helper for PUT with `Content-Range` / partial PATCH bodies: open
    /// read-write without truncation and position at `offset`.
    pub async fn put_at(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        offset: u64,
        conditions: &[Condition],
    ) -> FsResult<Box<dyn DavFile>> {
        self.allowed(DavMethod::PUT)?;
        self.confirm(path, None, conditions).await?;
        let mut file = self
            .fs
            .open(
                ctx,
                path,
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
                0o644,
            )
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file)
    }

    /// Write a whole body through a PUT handle and close it.
    ///
    /// Convenience for protocol handlers and tests; streaming callers drive
    /// the [`DavFile`] themselves.
    pub async fn put_bytes(
        &self,
        ctx: &DavContext,
        path: &DavPath,
        body: Bytes,
        conditions: &[Condition],
    ) -> FsResult<()> {
        let mut file = self.put(ctx, path, conditions).await?;
        let result = file.write_bytes(body).await;
        let closed = file.close().await;
        result?;
        closed
    }

    /// Read a whole file through a GET handle and close it.
    pub async fn get_bytes(&self, ctx: &DavContext, path: &DavPath) -> FsResult<Bytes> {
        let mut file = self.get(ctx, path).await?;
        let mut out = bytes::BytesMut::new();
        let result: FsResult<()> = async {
            loop {
                ctx.check_cancelled()?;
                let chunk = file.read_bytes(COPY_BUF_SIZE).await?;
                if chunk.is_empty() {
                    break;
                }
                out.extend_from_slice(&chunk);
            }
            Ok(())
        }
        .await;
        let closed = file.close().await;
        result?;
        closed?;
        Ok(out.freeze())
    }
}
