//! S3 file handles.
//!
//! Readers hold the GET response body and re-issue ranged GETs after a
//! seek. Writers feed a bounded pipe consumed by a background upload task:
//! bodies up to one part buffer as a single `PutObject`, anything larger
//! becomes a multipart upload with 5 MiB parts. `close` flushes the pipe
//! and blocks on the upload's completion channel, bounded by a hard
//! two-hour deadline.

use std::io::SeekFrom;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::s3fs::{list_dir, object_key, s3_io, to_system_time};
use crate::fs::{DavFile, FileInfo, FsFuture};

/// Multipart part size.
const PART_SIZE: usize = 5 * 1024 * 1024;

/// Absolute ceiling for close waiting on upload completion. Stalled
/// uploads are terminated with a timeout error.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

enum Mode {
    Directory,
    Reader {
        size: u64,
        modified: SystemTime,
        offset: u64,
        body: Option<BoxReader>,
    },
    Writer {
        tx: Option<mpsc::Sender<Bytes>>,
        done: Option<oneshot::Receiver<FsResult<()>>>,
        written: u64,
    },
}

pub struct S3File {
    client: Client,
    bucket: String,
    path: DavPath,
    ctx: DavContext,
    mode: Mode,
    closed: bool,
}

fn closed_err() -> FsError {
    FsError::InvalidArgument("file is closed".to_string())
}

impl S3File {
    pub(crate) fn directory(
        client: Client,
        bucket: String,
        path: DavPath,
        ctx: DavContext,
    ) -> S3File {
        S3File {
            client,
            bucket,
            path,
            ctx,
            mode: Mode::Directory,
            closed: false,
        }
    }

    pub(crate) fn reader(
        client: Client,
        bucket: String,
        path: DavPath,
        ctx: DavContext,
        obj: GetObjectOutput,
    ) -> S3File {
        let size = obj.content_length().unwrap_or(0).max(0) as u64;
        let modified = obj
            .last_modified()
            .map(to_system_time)
            .unwrap_or_else(SystemTime::now);
        S3File {
            client,
            bucket,
            path,
            ctx,
            mode: Mode::Reader {
                size,
                modified,
                offset: 0,
                body: Some(Box::pin(obj.body.into_async_read())),
            },
            closed: false,
        }
    }

    /// Open a writer and start its upload consumer. The consumer runs
    /// detached: a cancelled request no longer controls an upload that is
    /// past the point of no return. The caller's context still governs the
    /// client-facing write calls, which fail fast on cancellation.
    pub(crate) fn writer(client: Client, bucket: String, path: DavPath, ctx: DavContext) -> S3File {
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let (done_tx, done_rx) = oneshot::channel::<FsResult<()>>();

        let key = object_key(&path);
        let upload_client = client.clone();
        let upload_bucket = bucket.clone();
        tokio::spawn(async move {
            let result = upload_pipe(&upload_client, &upload_bucket, &key, rx).await;
            if let Err(err) = &result {
                error!("fs(s3): upload of {key} failed: {err}");
            }
            let _ = done_tx.send(result);
        });

        S3File {
            client,
            bucket,
            path,
            ctx,
            mode: Mode::Writer {
                tx: Some(tx),
                done: Some(done_rx),
                written: 0,
            },
            closed: false,
        }
    }
}

impl DavFile for S3File {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, FileInfo> {
        async move {
            let info = match &self.mode {
                // directories in S3 have no metadata of their own
                Mode::Directory => FileInfo {
                    name: self.path.name().to_string(),
                    size: 0,
                    mode: 0o755,
                    modified: SystemTime::now(),
                    is_dir: true,
                },
                Mode::Reader { size, modified, .. } => FileInfo {
                    name: self.path.name().to_string(),
                    size: *size,
                    mode: 0o644,
                    modified: *modified,
                    is_dir: false,
                },
                // nothing is committed until close
                Mode::Writer { .. } => FileInfo {
                    name: self.path.name().to_string(),
                    size: 0,
                    mode: 0o644,
                    modified: SystemTime::now(),
                    is_dir: false,
                },
            };
            Ok(info)
        }
        .boxed()
    }

    fn read_bytes<'a>(&'a mut self, count: usize) -> FsFuture<'a, Bytes> {
        async move {
            if self.closed {
                return Err(closed_err());
            }
            self.ctx.check_cancelled()?;
            let Mode::Reader {
                size,
                offset,
                body,
                ..
            } = &mut self.mode
            else {
                return Err(match self.mode {
                    Mode::Directory => FsError::IsDirectory,
                    _ => FsError::InvalidArgument("file opened for writing".to_string()),
                });
            };

            if count == 0 || *offset >= *size {
                return Ok(Bytes::new());
            }

            // after a seek the stream is gone; re-open at the offset
            if body.is_none() {
                let resp = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(object_key(&self.path))
                    .range(format!("bytes={offset}-"))
                    .send()
                    .await
                    .map_err(s3_io)?;
                *body = Some(Box::pin(resp.body.into_async_read()));
            }

            let reader = body.as_mut().expect("reader installed above");
            let want = count.min((*size - *offset) as usize);
            let mut buf = BytesMut::with_capacity(want);
            while buf.len() < want {
                let n = reader.read_buf(&mut buf).await.map_err(FsError::from)?;
                if n == 0 {
                    break;
                }
            }
            *offset += buf.len() as u64;
            Ok(buf.freeze())
        }
        .boxed()
    }

    fn write_bytes<'a>(&'a mut self, buf: Bytes) -> FsFuture<'a, ()> {
        async move {
            if self.closed {
                return Err(closed_err());
            }
            self.ctx.check_cancelled()?;
            let Mode::Writer { tx, written, .. } = &mut self.mode else {
                return Err(match self.mode {
                    Mode::Directory => FsError::IsDirectory,
                    _ => FsError::InvalidArgument("file opened for reading".to_string()),
                });
            };
            let sender = tx.as_ref().ok_or_else(closed_err)?;
            let len = buf.len() as u64;
            sender.send(buf).await.map_err(|_| {
                // the consumer died; close() will surface its error
                FsError::Io(std::sync::Arc::new(std::io::Error::other(
                    "s3 upload pipe closed",
                )))
            })?;
            *written += len;
            Ok(())
        }
        .boxed()
    }

    fn seek<'a>(&'a mut self, pos: SeekFrom) -> FsFuture<'a, u64> {
        async move {
            if self.closed {
                return Err(closed_err());
            }
            match &mut self.mode {
                Mode::Directory => Err(FsError::IsDirectory),
                Mode::Writer { written, .. } => {
                    // during a streaming upload only the position query is
                    // supported
                    if pos == SeekFrom::Current(0) {
                        Ok(*written)
                    } else {
                        Err(FsError::InvalidArgument(
                            "seek not supported during streaming upload".to_string(),
                        ))
                    }
                }
                Mode::Reader {
                    size,
                    offset,
                    body,
                    ..
                } => {
                    let target = match pos {
                        SeekFrom::Start(n) => n as i64,
                        SeekFrom::Current(delta) => *offset as i64 + delta,
                        SeekFrom::End(delta) => *size as i64 + delta,
                    };
                    if target < 0 {
                        return Err(FsError::InvalidArgument("negative offset".to_string()));
                    }
                    let target = target as u64;
                    if target != *offset {
                        *offset = target;
                        *body = None;
                    }
                    Ok(*offset)
                }
            }
        }
        .boxed()
    }

    fn read_dir<'a>(&'a mut self, count: usize) -> FsFuture<'a, Vec<FileInfo>> {
        async move {
            if self.closed {
                return Err(closed_err());
            }
            if !matches!(self.mode, Mode::Directory) {
                return Err(FsError::NotDirectory);
            }
            list_dir(&self.client, &self.bucket, &self.ctx, &self.path, count).await
        }
        .boxed()
    }

    fn close<'a>(&'a mut self) -> FsFuture<'a, ()> {
        async move {
            if self.closed {
                return Err(closed_err());
            }
            self.closed = true;

            match &mut self.mode {
                Mode::Directory => Ok(()),
                Mode::Reader { body, .. } => {
                    *body = None;
                    Ok(())
                }
                Mode::Writer { tx, done, .. } => {
                    // closing the pipe lets the consumer finish the upload
                    tx.take();
                    let done = done.take().ok_or_else(closed_err)?;
                    match tokio::time::timeout(CLOSE_TIMEOUT, done).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(_recv)) => Err(FsError::Io(std::sync::Arc::new(
                            std::io::Error::other("s3 upload task vanished"),
                        ))),
                        Err(_elapsed) => {
                            error!(
                                "fs(s3): upload of {} timed out at close",
                                object_key(&self.path)
                            );
                            Err(FsError::Timeout)
                        }
                    }
                }
            }
        }
        .boxed()
    }
}

struct PendingMultipart {
    upload_id: String,
    parts: Vec<CompletedPart>,
    next_part: i32,
}

/// Consume the write pipe and commit the object.
///
/// The multipart upload is created lazily on the first full part, so small
/// bodies commit with one plain PutObject. On failure any started
/// multipart upload is aborted.
async fn upload_pipe(
    client: &Client,
    bucket: &str,
    key: &str,
    mut rx: mpsc::Receiver<Bytes>,
) -> FsResult<()> {
    let mut pending: Option<PendingMultipart> = None;
    let result = drive_upload(client, bucket, key, &mut rx, &mut pending).await;

    if result.is_err() {
        if let Some(p) = &pending {
            if let Err(err) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&p.upload_id)
                .send()
                .await
            {
                error!("fs(s3): could not abort multipart upload of {key}: {err:?}");
            }
        }
    }

    result
}

async fn drive_upload(
    client: &Client,
    bucket: &str,
    key: &str,
    rx: &mut mpsc::Receiver<Bytes>,
    pending: &mut Option<PendingMultipart>,
) -> FsResult<()> {
    let mut buf = BytesMut::new();

    while let Some(chunk) = rx.recv().await {
        buf.extend_from_slice(&chunk);
        while buf.len() >= PART_SIZE {
            let part = buf.split_to(PART_SIZE).freeze();
            upload_part(client, bucket, key, pending, part).await?;
        }
    }

    match pending.as_mut() {
        None => {
            // everything fit below one part: a single PUT
            client
                .put_object()
                .bucket(bucket)
                .key(key)
                .content_type("application/octet-stream")
                .body(ByteStream::from(buf.freeze()))
                .send()
                .await
                .map_err(s3_io)?;
            Ok(())
        }
        Some(_) => {
            if !buf.is_empty() {
                let part = buf.freeze();
                upload_part(client, bucket, key, pending, part).await?;
            }
            let p = pending.as_mut().expect("multipart started");
            let completed = CompletedMultipartUpload::builder()
                .set_parts(Some(std::mem::take(&mut p.parts)))
                .build();
            client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(&p.upload_id)
                .multipart_upload(completed)
                .send()
                .await
                .map_err(s3_io)?;
            Ok(())
        }
    }
}

async fn upload_part(
    client: &Client,
    bucket: &str,
    key: &str,
    pending: &mut Option<PendingMultipart>,
    part: Bytes,
) -> FsResult<()> {
    if pending.is_none() {
        let created = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(s3_io)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| s3_io("multipart upload without an id"))?
            .to_string();
        *pending = Some(PendingMultipart {
            upload_id,
            parts: Vec::new(),
            next_part: 1,
        });
    }

    let p = pending.as_mut().expect("multipart started");
    let part_number = p.next_part;
    p.next_part += 1;

    let resp = client
        .upload_part()
        .bucket(bucket)
        .key(key)
        .upload_id(&p.upload_id)
        .part_number(part_number)
        .body(ByteStream::from(part))
        .send()
        .await
        .map_err(s3_io)?;

    p.parts.push(
        CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(resp.e_tag().map(str::to_string))
            .build(),
    );
    Ok(())
}
