//! SQLite file handles.
//!
//! Reads open a blob handle per call against the stored rowid, seek to the
//! in-handle offset and read into the caller's buffer; the handle itself
//! only tracks its offset. Writes buffer in an anonymous temp-file spool;
//! close streams the spool into the content blob inside one immediate
//! transaction, sizing the blob with `zeroblob(N)` first. The spool is
//! deleted in every outcome, because the handle owns the only reference.

use std::io::{Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

use bytes::Bytes;
use futures_util::FutureExt;
use rusqlite::{params, DatabaseName, OptionalExtension, TransactionBehavior};

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::sqlitefs::{db_err, now_unix, pool_err, unix_to_system, Pool};
use crate::fs::{DavFile, FileInfo, FsFuture, OpenFlags};

pub struct SqliteFile {
    pool: Pool,
    ctx: DavContext,
    path: DavPath,
    flags: OpenFlags,
    is_dir: bool,
    size: u64,
    mode: u32,
    modified: SystemTime,
    offset: u64,
    spool: Option<std::fs::File>,
}

impl SqliteFile {
    pub(crate) fn new(
        pool: Pool,
        ctx: DavContext,
        path: DavPath,
        flags: OpenFlags,
        info: FileInfo,
    ) -> SqliteFile {
        SqliteFile {
            pool,
            ctx,
            path,
            flags,
            is_dir: info.is_dir,
            size: info.size,
            mode: info.mode,
            modified: info.modified,
            offset: 0,
            spool: None,
        }
    }
}

fn content_rowid(conn: &rusqlite::Connection, path: &DavPath) -> FsResult<i64> {
    conn.query_row(
        "SELECT fc.rowid
         FROM file_contents fc
         JOIN files f ON fc.path = f.path
         WHERE f.path = ?1",
        params![path.as_str()],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)?
    .ok_or(FsError::NotFound)
}

impl DavFile for SqliteFile {
    fn metadata<'a>(&'a mut self) -> FsFuture<'a, FileInfo> {
        async move {
            Ok(FileInfo {
                name: self.path.name().to_string(),
                size: self.size,
                mode: self.mode,
                modified: self.modified,
                is_dir: self.is_dir,
            })
        }
        .boxed()
    }

    fn read_bytes<'a>(&'a mut self, count: usize) -> FsFuture<'a, Bytes> {
        async move {
            if self.is_dir {
                return Err(FsError::IsDirectory);
            }
            self.ctx.check_cancelled()?;

            if count == 0 || self.offset >= self.size {
                return Ok(Bytes::new());
            }
            let to_read = count.min((self.size - self.offset) as usize);

            let pool = self.pool.clone();
            let path = self.path.clone();
            let offset = self.offset;
            let data = tokio::task::spawn_blocking(move || -> FsResult<Vec<u8>> {
                let conn = pool.get().map_err(pool_err)?;
                let rowid = content_rowid(&conn, &path)?;

                let mut blob = conn
                    .blob_open(DatabaseName::Main, "file_contents", "content", rowid, true)
                    .map_err(db_err)?;
                blob.seek(SeekFrom::Start(offset)).map_err(FsError::from)?;

                let mut buf = vec![0u8; to_read];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = blob.read(&mut buf[filled..]).map_err(FsError::from)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            })
            .await
            .map_err(FsError::other)??;

            self.offset += data.len() as u64;
            Ok(Bytes::from(data))
        }
        .boxed()
    }

    fn write_bytes<'a>(&'a mut self, buf: Bytes) -> FsFuture<'a, ()> {
        async move {
            if self.is_dir {
                return Err(FsError::IsDirectory);
            }
            if !self
                .flags
                .intersects(OpenFlags::WRITE | OpenFlags::APPEND)
            {
                return Err(FsError::Forbidden);
            }
            self.ctx.check_cancelled()?;

            let spool = self.spool.take();
            let (spool, result) =
                tokio::task::spawn_blocking(move || -> (Option<std::fs::File>, FsResult<()>) {
                    let mut file = match spool {
                        Some(file) => file,
                        None => match tempfile::tempfile() {
                            Ok(file) => file,
                            Err(err) => return (None, Err(err.into())),
                        },
                    };
                    let result = file.write_all(&buf).map_err(FsError::from);
                    (Some(file), result)
                })
                .await
                .map_err(FsError::other)?;

            self.spool = spool;
            result
        }
        .boxed()
    }

    fn seek<'a>(&'a mut self, pos: SeekFrom) -> FsFuture<'a, u64> {
        async move {
            if self.is_dir {
                return Err(FsError::IsDirectory);
            }
            let target = match pos {
                SeekFrom::Start(n) => n as i64,
                SeekFrom::Current(delta) => self.offset as i64 + delta,
                SeekFrom::End(delta) => self.size as i64 + delta,
            };
            if target < 0 {
                return Err(FsError::InvalidArgument("negative offset".to_string()));
            }
            self.offset = target as u64;
            Ok(self.offset)
        }
        .boxed()
    }

    fn read_dir<'a>(&'a mut self, count: usize) -> FsFuture<'a, Vec<FileInfo>> {
        async move {
            if !self.is_dir {
                return Err(FsError::NotDirectory);
            }
            self.ctx.check_cancelled()?;

            let pool = self.pool.clone();
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || -> FsResult<Vec<FileInfo>> {
                let conn = pool.get().map_err(pool_err)?;
                let prefix = if path.is_root() {
                    "/".to_string()
                } else {
                    format!("{}/", path.as_str())
                };

                let mut stmt = conn
                    .prepare(
                        "SELECT path, is_dir, mode, size, mtime FROM files
                         WHERE path LIKE ?1 AND path != ?2",
                    )
                    .map_err(db_err)?;
                let rows = stmt
                    .query_map(params![format!("{prefix}%"), path.as_str()], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                        ))
                    })
                    .map_err(db_err)?;

                let mut entries = Vec::new();
                for row in rows {
                    let (child, is_dir, mode, size, mtime) = row.map_err(db_err)?;
                    // keep direct children only
                    let Some(rel) = child.strip_prefix(&prefix) else {
                        continue;
                    };
                    if rel.is_empty() || rel.contains('/') {
                        continue;
                    }
                    entries.push(FileInfo {
                        name: rel.to_string(),
                        is_dir: is_dir == 1,
                        mode: mode as u32,
                        size: size.max(0) as u64,
                        modified: unix_to_system(mtime),
                    });
                    if count > 0 && entries.len() >= count {
                        break;
                    }
                }
                Ok(entries)
            })
            .await
            .map_err(FsError::other)?
        }
        .boxed()
    }

    fn close<'a>(&'a mut self) -> FsFuture<'a, ()> {
        async move {
            let Some(mut spool) = self.spool.take() else {
                return Ok(());
            };
            self.ctx.check_cancelled()?;

            let pool = self.pool.clone();
            let path = self.path.clone();
            let committed =
                tokio::task::spawn_blocking(move || -> FsResult<u64> {
                    let mut conn = pool.get().map_err(pool_err)?;
                    let size = spool.metadata().map_err(FsError::from)?.len();
                    spool.seek(SeekFrom::Start(0)).map_err(FsError::from)?;

                    let tx = conn
                        .transaction_with_behavior(TransactionBehavior::Immediate)
                        .map_err(db_err)?;
                    let rowid = content_rowid(&tx, &path)?;
                    tx.execute(
                        "UPDATE file_contents SET content = zeroblob(?1) WHERE path = ?2",
                        params![size as i64, path.as_str()],
                    )
                    .map_err(db_err)?;
                    tx.execute(
                        "UPDATE files SET size = ?1, mtime = ?2 WHERE path = ?3",
                        params![size as i64, now_unix(), path.as_str()],
                    )
                    .map_err(db_err)?;

                    let mut blob = tx
                        .blob_open(DatabaseName::Main, "file_contents", "content", rowid, false)
                        .map_err(db_err)?;
                    std::io::copy(&mut spool, &mut blob).map_err(FsError::from)?;
                    drop(blob);

                    tx.commit().map_err(db_err)?;
                    // the spool is dropped (and deleted) here in every case
                    Ok(size)
                })
                .await
                .map_err(FsError::other)??;

            self.size = committed;
            self.modified = SystemTime::now();
            Ok(())
        }
        .boxed()
    }
}
