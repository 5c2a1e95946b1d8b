//! The filesystem contract.
//!
//! Every storage backend implements [`DavFileSystem`]; open files implement
//! [`DavFile`]. The traits use boxed futures so that backends, middlewares
//! and the composition root can all be held behind `Arc<dyn DavFileSystem>`.
//!
//! Included backends:
//!
//! - [`localfs::LocalFs`]: a directory on the local filesystem
//! - [`s3fs::S3Fs`]: an S3 bucket, with hierarchical mapping
//! - [`sqlitefs::SqliteFs`]: a single SQLite database

pub mod localfs;
pub mod registry;
pub mod s3fs;
pub mod sqlitefs;

use std::future::Future;
use std::io::SeekFrom;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use bytes::Bytes;
use futures_util::future;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::props::{DavProp, PropPatch, PropStat};

/// The future returned by almost all filesystem methods.
pub type FsFuture<'a, T> = Pin<Box<dyn Future<Output = FsResult<T>> + Send + 'a>>;

bitflags! {
    /// How a file is opened.
    ///
    /// A handle is bound to its flags at open time; operations outside the
    /// requested set fail.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
        const CREATE = 0x08;
        const CREATE_NEW = 0x10;
        const TRUNCATE = 0x20;

        /// Every flag that can mutate the file.
        const WRITE_MASK = Self::WRITE.bits()
            | Self::APPEND.bits()
            | Self::CREATE.bits()
            | Self::CREATE_NEW.bits()
            | Self::TRUNCATE.bits();
    }
}

impl OpenFlags {
    /// True if opening with these flags can mutate the target.
    pub fn is_write(&self) -> bool {
        self.intersects(OpenFlags::WRITE_MASK)
    }
}

/// Metadata for a file or directory.
///
/// Backends synthesize fields their store does not track: S3 directory
/// listings report size 4096 and the newest child mtime, the synthetic root
/// reports size 4096.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Base name of the entry (`/` for the root).
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits, POSIX convention.
    pub mode: u32,
    /// Modification time.
    pub modified: SystemTime,
    pub is_dir: bool,
}

impl FileInfo {
    // same layout as the default apache etag.
    pub fn etag(&self) -> String {
        let t = self
            .modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let t = t.as_secs() * 1_000_000 + t.subsec_nanos() as u64 / 1000;
        if self.is_dir {
            format!("{t:x}")
        } else {
            format!("{:x}-{t:x}", self.size)
        }
    }
}

/// An open file handle.
///
/// Handles are readable/writable/seekable byte streams with a directory
/// listing capability and an explicit close. Backends with deferred commits
/// (S3 multipart uploads, the SQLite blob spool) finish their work in
/// `close`, so a handle that is dropped without closing may lose its write.
pub trait DavFile: Send {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, FileInfo>;

    /// Read up to `count` bytes from the current offset.
    ///
    /// An empty result means end-of-file.
    fn read_bytes<'a>(&'a mut self, count: usize) -> FsFuture<'a, Bytes>;

    fn write_bytes<'a>(&'a mut self, buf: Bytes) -> FsFuture<'a, ()>;

    fn seek<'a>(&'a mut self, pos: SeekFrom) -> FsFuture<'a, u64>;

    /// List directory entries. `count == 0` returns the full listing.
    fn read_dir<'a>(&'a mut self, count: usize) -> FsFuture<'a, Vec<FileInfo>>;

    fn close<'a>(&'a mut self) -> FsFuture<'a, ()>;
}

/// A storage backend.
///
/// All paths are normalized [`DavPath`] values. The parent of the target
/// must exist and be a directory for `mkdir`, create-opens and `rename`.
pub trait DavFileSystem: Send + Sync + 'static {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()>;

    fn open<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        flags: OpenFlags,
        mode: u32,
    ) -> FsFuture<'a, Box<dyn DavFile>>;

    /// Remove a file or directory tree. Removing a non-existent path is OK.
    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()>;

    fn rename<'a>(
        &'a self,
        ctx: &'a DavContext,
        from: &'a DavPath,
        to: &'a DavPath,
    ) -> FsFuture<'a, ()>;

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo>;

    /// Dead properties stored for `path`.
    ///
    /// Backends do not store properties themselves; the dead-props
    /// middleware implements these two methods and every other middleware
    /// forwards them.
    fn get_props<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        let _ = (ctx, path);
        Box::pin(future::ready(Err(FsError::NotImplemented)))
    }

    /// Apply a sequence of property patches to `path`.
    fn patch_props<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        patches: Vec<PropPatch>,
    ) -> FsFuture<'a, Vec<PropStat>> {
        let _ = (ctx, path, patches);
        Box::pin(future::ready(Err(FsError::NotImplemented)))
    }
}
