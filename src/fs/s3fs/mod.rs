//! S3 object storage backend.
//!
//! Maps a flat object store onto the hierarchical filesystem contract:
//!
//! - a directory is either a zero-byte object whose key ends in `/`, or
//!   implied by any object existing under its prefix
//! - `stat` tries `HEAD` on the key first and falls back to a prefix
//!   listing to detect implicit directories
//! - writes stream through a pipe into a background upload task (see
//!   [`file`])
//! - rename is copy+delete, recursive for directories
//! - `remove_all` streams listed keys into a bulk-delete channel
//!
//! There is no atomicity across objects; partial failures surface the first
//! error encountered.

pub mod file;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};

use file::S3File;

/// Objects per bulk-delete request, the S3 maximum.
const DELETE_BATCH: usize = 1000;

pub struct S3Fs {
    client: Client,
    bucket: String,
}

pub(crate) fn s3_io<E: std::fmt::Debug>(err: E) -> FsError {
    FsError::Io(Arc::new(std::io::Error::other(format!("{err:?}"))))
}

pub(crate) fn to_system_time(dt: &aws_sdk_s3::primitives::DateTime) -> SystemTime {
    if dt.secs() >= 0 {
        UNIX_EPOCH + Duration::new(dt.secs() as u64, dt.subsec_nanos())
    } else {
        UNIX_EPOCH
    }
}

/// Object key for a path: no leading slash, empty for the root.
pub(crate) fn object_key(path: &DavPath) -> String {
    path.as_str().trim_start_matches('/').to_string()
}

/// Key of the directory marker / listing prefix for a path.
pub(crate) fn dir_key(path: &DavPath) -> String {
    if path.is_root() {
        String::new()
    } else {
        format!("{}/", object_key(path))
    }
}

/// Non-recursive listing of the direct children of `path`.
///
/// Subdirectories come back from the delimiter listing as common prefixes;
/// the directory's own marker object is skipped.
pub(crate) async fn list_dir(
    client: &Client,
    bucket: &str,
    ctx: &DavContext,
    path: &DavPath,
    count: usize,
) -> FsResult<Vec<FileInfo>> {
    let prefix = dir_key(path);
    let mut entries = Vec::new();
    let mut continuation: Option<String> = None;

    'pages: loop {
        ctx.check_cancelled()?;
        let resp = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(&prefix)
            .delimiter("/")
            .set_continuation_token(continuation.take())
            .send()
            .await
            .map_err(s3_io)?;

        for common in resp.common_prefixes() {
            let Some(p) = common.prefix() else { continue };
            let name = p
                .strip_prefix(prefix.as_str())
                .unwrap_or(p)
                .trim_end_matches('/');
            if name.is_empty() {
                continue;
            }
            entries.push(FileInfo {
                name: name.to_string(),
                size: 0,
                mode: 0o755,
                modified: SystemTime::now(),
                is_dir: true,
            });
            if count > 0 && entries.len() >= count {
                break 'pages;
            }
        }

        for object in resp.contents() {
            let Some(key) = object.key() else { continue };
            // skip the directory marker itself
            if key == prefix {
                continue;
            }
            let name = key.strip_prefix(prefix.as_str()).unwrap_or(key);
            if name.is_empty() || name.contains('/') {
                continue;
            }
            entries.push(FileInfo {
                name: name.to_string(),
                size: object.size().unwrap_or(0).max(0) as u64,
                mode: 0o644,
                modified: object
                    .last_modified()
                    .map(to_system_time)
                    .unwrap_or_else(SystemTime::now),
                is_dir: false,
            });
            if count > 0 && entries.len() >= count {
                break 'pages;
            }
        }

        if resp.is_truncated() == Some(true) {
            continuation = resp.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        } else {
            break;
        }
    }

    Ok(entries)
}

impl S3Fs {
    pub fn new(client: Client, bucket: impl Into<String>) -> Arc<S3Fs> {
        Arc::new(S3Fs {
            client,
            bucket: bucket.into(),
        })
    }

    async fn stat_inner(&self, ctx: &DavContext, path: &DavPath) -> FsResult<FileInfo> {
        ctx.check_cancelled()?;

        if path.is_root() {
            return Ok(FileInfo {
                name: "/".to_string(),
                size: 4096,
                mode: 0o755,
                modified: SystemTime::now(),
                is_dir: true,
            });
        }

        let key = object_key(path);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(head) => Ok(FileInfo {
                name: path.name().to_string(),
                size: head.content_length().unwrap_or(0).max(0) as u64,
                mode: 0o644,
                modified: head
                    .last_modified()
                    .map(to_system_time)
                    .unwrap_or_else(SystemTime::now),
                is_dir: false,
            }),
            Err(err) => {
                if !err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    return Err(s3_io(err));
                }
                self.stat_dir(ctx, path).await
            }
        }
    }

    /// Probe for an explicit or implicit directory: any object under the
    /// prefix proves the directory exists. The mtime reported is the newest
    /// one found among its descendants.
    async fn stat_dir(&self, ctx: &DavContext, path: &DavPath) -> FsResult<FileInfo> {
        let prefix = dir_key(path);
        let mut found = false;
        let mut modified: Option<SystemTime> = None;
        let mut continuation: Option<String> = None;

        loop {
            ctx.check_cancelled()?;
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(s3_io)?;

            for object in resp.contents() {
                found = true;
                if let Some(lm) = object.last_modified() {
                    let t = to_system_time(lm);
                    if modified.map_or(true, |m| t > m) {
                        modified = Some(t);
                    }
                }
            }

            if resp.is_truncated() == Some(true) {
                continuation = resp.next_continuation_token().map(str::to_string);
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        if !found {
            return Err(FsError::NotFound);
        }

        Ok(FileInfo {
            name: path.name().to_string(),
            size: 4096,
            mode: 0o755,
            modified: modified.unwrap_or_else(SystemTime::now),
            is_dir: true,
        })
    }

    async fn check_parent(&self, ctx: &DavContext, path: &DavPath) -> FsResult<()> {
        if path.is_root() {
            return Ok(());
        }
        let parent = path.parent();
        if parent.is_root() {
            return Ok(());
        }
        let info = self.stat_inner(ctx, &parent).await?;
        if !info.is_dir {
            // the parent exists but is a file; no child can live there.
            return Err(FsError::NotFound);
        }
        Ok(())
    }

    async fn mkdir_inner(&self, ctx: &DavContext, path: &DavPath) -> FsResult<()> {
        match self.stat_inner(ctx, path).await {
            Ok(_) => return Err(FsError::Exists),
            Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }
        self.check_parent(ctx, path).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(dir_key(path))
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(s3_io)?;
        Ok(())
    }

    /// Copy then delete. S3 has no atomic move.
    async fn move_object(&self, ctx: &DavContext, old_key: &str, new_key: &str) -> FsResult<()> {
        ctx.check_cancelled()?;

        use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
        const COPY_SOURCE: &AsciiSet = &CONTROLS
            .add(b' ')
            .add(b'"')
            .add(b'#')
            .add(b'%')
            .add(b'<')
            .add(b'>')
            .add(b'?')
            .add(b'\\')
            .add(b'^')
            .add(b'`')
            .add(b'{')
            .add(b'|')
            .add(b'}');

        let source = format!(
            "{}/{}",
            self.bucket,
            utf8_percent_encode(old_key, COPY_SOURCE)
        );
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(new_key)
            .copy_source(source)
            .send()
            .await
            .map_err(s3_io)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(old_key)
            .send()
            .await
            .map_err(s3_io)?;
        Ok(())
    }

    /// Recursive directory move: create the target, move the children,
    /// remove the old marker.
    fn rename_tree<'a>(
        &'a self,
        ctx: &'a DavContext,
        from: DavPath,
        to: DavPath,
    ) -> FsFuture<'a, ()> {
        async move {
            match self.mkdir_inner(ctx, &to).await {
                Ok(()) | Err(FsError::Exists) => {}
                Err(err) => return Err(err),
            }

            let children = list_dir(&self.client, &self.bucket, ctx, &from, 0).await?;
            for child in children {
                let old = from.join(&child.name);
                let new = to.join(&child.name);
                if child.is_dir {
                    self.rename_tree(ctx, old, new).await?;
                } else {
                    self.move_object(ctx, &object_key(&old), &object_key(&new))
                        .await?;
                }
            }

            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(dir_key(&from))
                .send()
                .await
                .map_err(s3_io)?;
            Ok(())
        }
        .boxed()
    }

    /// Drain the bulk-delete channel, issuing batched DeleteObjects calls.
    /// Any delete failure is fatal.
    async fn delete_batches(
        &self,
        ctx: &DavContext,
        mut rx: mpsc::Receiver<ObjectIdentifier>,
    ) -> FsResult<()> {
        let mut batch: Vec<ObjectIdentifier> = Vec::with_capacity(DELETE_BATCH);
        loop {
            let id = rx.recv().await;
            let drained = id.is_none();
            if let Some(id) = id {
                batch.push(id);
            }
            if batch.len() >= DELETE_BATCH || (drained && !batch.is_empty()) {
                ctx.check_cancelled()?;
                let delete = Delete::builder()
                    .set_objects(Some(std::mem::take(&mut batch)))
                    .build()
                    .map_err(s3_io)?;
                let resp = self
                    .client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(s3_io)?;
                if let Some(err) = resp.errors().first() {
                    return Err(s3_io(err));
                }
            }
            if drained {
                return Ok(());
            }
        }
    }
}

impl DavFileSystem for S3Fs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, _mode: u32) -> FsFuture<'a, ()> {
        async move {
            trace!("fs(s3): mkdir {path:?}");
            ctx.check_cancelled()?;
            self.mkdir_inner(ctx, path).await
        }
        .boxed()
    }

    fn open<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        flags: OpenFlags,
        _mode: u32,
    ) -> FsFuture<'a, Box<dyn DavFile>> {
        async move {
            trace!("fs(s3): open {path:?} {flags:?}");
            ctx.check_cancelled()?;

            if path.is_root() && !flags.is_write() {
                return Ok(Box::new(S3File::directory(
                    self.client.clone(),
                    self.bucket.clone(),
                    path.clone(),
                    ctx.clone(),
                )) as Box<dyn DavFile>);
            }

            if flags.is_write() {
                if flags.contains(OpenFlags::CREATE_NEW) {
                    match self.stat_inner(ctx, path).await {
                        Ok(_) => return Err(FsError::Exists),
                        Err(FsError::NotFound) => {}
                        Err(err) => return Err(err),
                    }
                }
                if flags.contains(OpenFlags::CREATE) {
                    self.check_parent(ctx, path).await?;
                }
                return Ok(Box::new(S3File::writer(
                    self.client.clone(),
                    self.bucket.clone(),
                    path.clone(),
                    ctx.clone(),
                )) as Box<dyn DavFile>);
            }

            let key = object_key(path);
            match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
            {
                Ok(obj) => {
                    let is_marker = obj
                        .content_type()
                        .is_some_and(|t| t == "application/x-directory");
                    if is_marker {
                        return Ok(Box::new(S3File::directory(
                            self.client.clone(),
                            self.bucket.clone(),
                            path.clone(),
                            ctx.clone(),
                        )) as Box<dyn DavFile>);
                    }
                    Ok(Box::new(S3File::reader(
                        self.client.clone(),
                        self.bucket.clone(),
                        path.clone(),
                        ctx.clone(),
                        obj,
                    )) as Box<dyn DavFile>)
                }
                Err(err) => {
                    if !err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                        return Err(s3_io(err));
                    }
                    // no object: an explicit marker or any key under the
                    // prefix still makes this a directory.
                    let resp = self
                        .client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(dir_key(path))
                        .max_keys(1)
                        .send()
                        .await
                        .map_err(s3_io)?;
                    if resp.key_count().unwrap_or(0) > 0 || !resp.contents().is_empty() {
                        return Ok(Box::new(S3File::directory(
                            self.client.clone(),
                            self.bucket.clone(),
                            path.clone(),
                            ctx.clone(),
                        )) as Box<dyn DavFile>);
                    }
                    Err(FsError::NotFound)
                }
            }
        }
        .boxed()
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            trace!("fs(s3): remove_all {path:?}");
            let info = match self.stat_inner(ctx, path).await {
                Ok(info) => info,
                Err(FsError::NotFound) => return Ok(()),
                Err(err) => return Err(err),
            };

            if !info.is_dir {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(object_key(path))
                    .send()
                    .await
                    .map_err(s3_io)?;
                return Ok(());
            }

            // stream every key under the prefix into the bulk-delete
            // channel. Listing failures are logged and terminate the
            // stream; delete failures are fatal.
            let (tx, rx) = mpsc::channel::<ObjectIdentifier>(DELETE_BATCH);
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let prefix = dir_key(path);
            tokio::spawn(async move {
                let mut continuation: Option<String> = None;
                loop {
                    let resp = match client
                        .list_objects_v2()
                        .bucket(&bucket)
                        .prefix(&prefix)
                        .set_continuation_token(continuation.take())
                        .send()
                        .await
                    {
                        Ok(resp) => resp,
                        Err(err) => {
                            error!("fs(s3): could not list objects under {prefix}: {err:?}");
                            return;
                        }
                    };
                    for object in resp.contents() {
                        let Some(key) = object.key() else { continue };
                        let id = match ObjectIdentifier::builder().key(key).build() {
                            Ok(id) => id,
                            Err(err) => {
                                error!("fs(s3): bad object key {key}: {err:?}");
                                continue;
                            }
                        };
                        if tx.send(id).await.is_err() {
                            return; // consumer gave up
                        }
                    }
                    if resp.is_truncated() == Some(true) {
                        continuation = resp.next_continuation_token().map(str::to_string);
                        if continuation.is_none() {
                            return;
                        }
                    } else {
                        return;
                    }
                }
            });

            self.delete_batches(ctx, rx).await?;

            // best effort on the marker: it may have been part of the
            // listing already.
            let _ = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(dir_key(path))
                .send()
                .await;
            Ok(())
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
            trace!("fs(s3): rename {from:?} {to:?}");
            let info = self.stat_inner(ctx, from).await?;
            self.check_parent(ctx, to).await?;

            if info.is_dir {
                self.rename_tree(ctx, from.clone(), to.clone()).await
            } else {
                self.move_object(ctx, &object_key(from), &object_key(to))
                    .await
            }
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        async move { self.stat_inner(ctx, path).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(object_key(&DavPath::root()), "");
        assert_eq!(object_key(&DavPath::new("/a/b")), "a/b");
        assert_eq!(dir_key(&DavPath::root()), "");
        assert_eq!(dir_key(&DavPath::new("/a/b")), "a/b/");
    }
}
