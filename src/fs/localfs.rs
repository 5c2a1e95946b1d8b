//! Local filesystem access.
//!
//! A thin mapping onto an operating-system directory rooted at a configured
//! base path. All semantics are delegated to the host filesystem; escaping
//! above the root is impossible because [`DavPath`] normalization resolves
//! relative segments before they reach this backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::FsError;
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};

/// Local filesystem backend, serving a base directory.
pub struct LocalFs {
    basedir: PathBuf,
}

struct LocalFile {
    file: Option<tokio::fs::File>,
    path: PathBuf,
    name: String,
    flags: OpenFlags,
    is_dir: bool,
}

impl LocalFs {
    /// Create a new local backend serving `base`.
    ///
    /// The directory itself is not created here; the registry factory takes
    /// care of that when building from configuration.
    pub fn new(base: impl Into<PathBuf>) -> Arc<LocalFs> {
        Arc::new(LocalFs {
            basedir: base.into(),
        })
    }

    fn abs_path(&self, path: &DavPath) -> PathBuf {
        let mut pathbuf = self.basedir.clone();
        pathbuf.push(path.as_rel_ospath());
        pathbuf
    }
}

fn file_info(name: &str, meta: &std::fs::Metadata) -> FileInfo {
    #[cfg(unix)]
    let mode = meta.permissions().mode() & 0o7777;
    #[cfg(not(unix))]
    let mode = if meta.is_dir() { 0o755 } else { 0o644 };
    FileInfo {
        name: name.to_string(),
        size: meta.len(),
        mode,
        modified: meta.modified().unwrap_or(UNIX_EPOCH),
        is_dir: meta.is_dir(),
    }
}

impl DavFileSystem for LocalFs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()> {
        async move {
            trace!("fs(local): mkdir {path:?}");
            ctx.check_cancelled()?;
            let abs = self.abs_path(path);
            #[allow(unused_mut)]
            let mut dir = tokio::fs::DirBuilder::new();
            #[cfg(unix)]
            {
                dir.mode(mode);
            }
            #[cfg(not(unix))]
            let _ = mode;
            Ok(dir.create(abs).await?)
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
            trace!("fs(local): open {path:?} {flags:?}");
            ctx.check_cancelled()?;
            let abs = self.abs_path(path);

            if let Ok(meta) = tokio::fs::metadata(&abs).await {
                if meta.is_dir() {
                    if flags.is_write() {
                        return Err(FsError::IsDirectory);
                    }
                    return Ok(Box::new(LocalFile {
                        file: None,
                        path: abs,
                        name: path.name().to_string(),
                        flags,
                        is_dir: true,
                    }) as Box<dyn DavFile>);
                }
            }

            let mut opt = tokio::fs::OpenOptions::new();
            opt.read(flags.contains(OpenFlags::READ))
                .write(flags.contains(OpenFlags::WRITE))
                .append(flags.contains(OpenFlags::APPEND))
                .truncate(flags.contains(OpenFlags::TRUNCATE))
                .create(flags.contains(OpenFlags::CREATE))
                .create_new(flags.contains(OpenFlags::CREATE_NEW));
            #[cfg(unix)]
            opt.mode(mode);
            #[cfg(not(unix))]
            let _ = mode;

            let file = opt.open(&abs).await?;
            Ok(Box::new(LocalFile {
                file: Some(file),
                path: abs,
                name: path.name().to_string(),
                flags,
                is_dir: false,
            }) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            trace!("fs(local): remove_all {path:?}");
            ctx.check_cancelled()?;
            let abs = self.abs_path(path);
            let meta = match tokio::fs::metadata(&abs).await {
                Ok(meta) => meta,
                // removing something that is not there is not an error.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                Ok(tokio::fs::remove_dir_all(abs).await?)
            } else {
                Ok(tokio::fs::remove_file(abs).await?)
            }
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
            trace!("fs(local): rename {from:?} {to:?}");
            ctx.check_cancelled()?;
            let p_from = self.abs_path(from);
            let p_to = self.abs_path(to);
            match tokio::fs::rename(&p_from, &p_to).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // webdav allows a rename from a directory to a file.
                    // note that this check is racy, and I'm not quite sure what
                    // we should do if the source is a symlink. anyway ...
                    #[cfg(unix)]
                    if e.raw_os_error() == Some(libc::ENOTDIR) && p_from.is_dir() {
                        // remove and try again.
                        let _ = tokio::fs::remove_file(&p_to).await;
                        return Ok(tokio::fs::rename(p_from, p_to).await?);
                    }
                    Err(e.into())
                }
            }
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        async move {
            ctx.check_cancelled()?;
            let abs = self.abs_path(path);
            let meta = tokio::fs::metadata(abs).await?;
            Ok(file_info(path.name(), &meta))
        }
        .boxed()
    }
}

impl DavFile for LocalFile {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, FileInfo> {
        async move {
            let meta = match &self.file {
                Some(file) => file.metadata().await?,
                None => tokio::fs::metadata(&self.path).await?,
            };
            Ok(file_info(&self.name, &meta))
        }
        .boxed()
    }

    fn read_bytes<'a>(&'a mut self, count: usize) -> FsFuture<'a, Bytes> {
        async move {
            if self.is_dir {
                return Err(FsError::IsDirectory);
            }
            let file = self.file.as_mut().ok_or(FsError::NotFound)?;
            let mut buf = BytesMut::with_capacity(count);
            while file.read_buf(&mut buf).await? > 0 {}
            Ok(buf.freeze())
        }
        .boxed()
    }

    fn write_bytes<'a>(&'a mut self, buf: Bytes) -> FsFuture<'a, ()> {
        async move {
            if self.is_dir {
                return Err(FsError::IsDirectory);
            }
            if !self.flags.is_write() {
                return Err(FsError::Forbidden);
            }
            let file = self.file.as_mut().ok_or(FsError::NotFound)?;
            Ok(file.write_all(&buf).await?)
        }
        .boxed()
    }

    fn seek<'a>(&'a mut self, pos: std::io::SeekFrom) -> FsFuture<'a, u64> {
        async move {
            if self.is_dir {
                return Err(FsError::IsDirectory);
            }
            let file = self.file.as_mut().ok_or(FsError::NotFound)?;
            Ok(file.seek(pos).await?)
        }
        .boxed()
    }

    fn read_dir<'a>(&'a mut self, count: usize) -> FsFuture<'a, Vec<FileInfo>> {
        async move {
            if !self.is_dir {
                return Err(FsError::NotDirectory);
            }
            let mut read_dir = tokio::fs::read_dir(&self.path).await?;
            let mut entries = Vec::new();
            loop {
                match read_dir.next_entry().await {
                    Ok(Some(entry)) => {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        match entry.metadata().await {
                            Ok(meta) => entries.push(file_info(&name, &meta)),
                            Err(e) => {
                                debug!("fs(local): read_dir metadata failed for {name}: {e}");
                            }
                        }
                        if count > 0 && entries.len() >= count {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("fs(local): read_dir failed: {e}");
                        break;
                    }
                }
            }
            Ok(entries)
        }
        .boxed()
    }

    fn close<'a>(&'a mut self) -> FsFuture<'a, ()> {
        async move {
            if let Some(mut file) = self.file.take() {
                if self.flags.is_write() {
                    file.flush().await?;
                    file.sync_all().await?;
                }
            }
            Ok(())
        }
        .boxed()
    }
}
