//! Operation logging middleware.
//!
//! Logs each filesystem operation through the `log` facade: a trace line on
//! entry, a debug or error line on failure depending on how noteworthy the
//! failure is. Cancellations are not logged; they are the client hanging up.

use std::sync::Arc;

use futures_util::FutureExt;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::FsError;
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};
use crate::middleware::Middleware;
use crate::props::{DavProp, PropPatch, PropStat};

pub struct LoggerFs {
    backend: Arc<dyn DavFileSystem>,
}

impl LoggerFs {
    pub fn new(backend: Arc<dyn DavFileSystem>) -> Arc<LoggerFs> {
        Arc::new(LoggerFs { backend })
    }
}

/// Middleware adding per-operation logging to a filesystem chain.
pub fn middleware() -> Middleware {
    Box::new(|next| LoggerFs::new(next))
}

fn log_failure(op: &str, path: &DavPath, err: &FsError) {
    match err {
        FsError::Cancelled => {}
        FsError::Io(_) | FsError::Timeout => error!("fs: {op} {path} failed: {err}"),
        _ => debug!("fs: {op} {path} failed: {err}"),
    }
}

impl DavFileSystem for LoggerFs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()> {
        async move {
            trace!("fs: mkdir {path} mode={mode:o}");
            self.backend
                .mkdir(ctx, path, mode)
                .await
                .inspect_err(|err| log_failure("mkdir", path, err))
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
            trace!("fs: open {path} {flags:?}");
            self.backend
                .open(ctx, path, flags, mode)
                .await
                .inspect_err(|err| log_failure("open", path, err))
        }
        .boxed()
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            trace!("fs: remove_all {path}");
            self.backend
                .remove_all(ctx, path)
                .await
                .inspect_err(|err| log_failure("remove_all", path, err))
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
            trace!("fs: rename {from} -> {to}");
            self.backend
                .rename(ctx, from, to)
                .await
                .inspect_err(|err| log_failure("rename", from, err))
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        async move {
            trace!("fs: stat {path}");
            self.backend
                .metadata(ctx, path)
                .await
                .inspect_err(|err| log_failure("stat", path, err))
        }
        .boxed()
    }

    fn get_props<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        self.backend.get_props(ctx, path)
    }

    fn patch_props<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        patches: Vec<PropPatch>,
    ) -> FsFuture<'a, Vec<PropStat>> {
        self.backend.patch_props(ctx, path, patches)
    }
}
