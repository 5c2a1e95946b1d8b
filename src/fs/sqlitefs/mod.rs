//! SQLite storage backend.
//!
//! The whole tree lives in one database:
//!
//! - `files(path PK, is_dir, mode, size, mtime)` is the namespace
//! - `file_contents(path PK → files.path, content BLOB)` holds the bytes
//!
//! Connections come from an `r2d2` pool with foreign keys on, a 5 second
//! busy timeout, full auto-vacuum and WAL journaling; an idempotent
//! migration creates the tables and the root row on every open. All calls
//! run on the blocking thread pool.
//!
//! Writes spool to a temp file and commit in a single immediate
//! transaction on close (see [`file`]); file creation inserts the metadata
//! row and the empty content blob in one transaction, and the `ON DELETE /
//! ON UPDATE CASCADE` foreign key keeps both tables in step for removals
//! and renames.

pub mod file;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};

use file::SqliteFile;

pub(crate) type Pool = r2d2::Pool<SqliteConnectionManager>;

pub struct SqliteFs {
    pool: Pool,
}

pub(crate) fn db_err(err: rusqlite::Error) -> FsError {
    FsError::Io(Arc::new(std::io::Error::other(err)))
}

pub(crate) fn pool_err(err: r2d2::Error) -> FsError {
    FsError::Io(Arc::new(std::io::Error::other(err)))
}

fn join_err(err: tokio::task::JoinError) -> FsError {
    FsError::Io(Arc::new(std::io::Error::other(err)))
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub(crate) fn unix_to_system(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

/// Run a blocking database closure on the blocking pool.
pub(crate) async fn with_conn<T, F>(pool: &Pool, ctx: &DavContext, f: F) -> FsResult<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> FsResult<T> + Send + 'static,
{
    ctx.check_cancelled()?;
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(pool_err)?;
        f(&mut conn)
    })
    .await
    .map_err(join_err)?
}

/// Fetch the metadata row for a path.
pub(crate) fn stat_row(conn: &Connection, path: &DavPath) -> FsResult<FileInfo> {
    let name = path.name().to_string();
    conn.query_row(
        "SELECT is_dir, mode, size, mtime FROM files WHERE path = ?1",
        params![path.as_str()],
        |row| {
            Ok(FileInfo {
                name: name.clone(),
                is_dir: row.get::<_, i64>(0)? == 1,
                mode: row.get::<_, i64>(1)? as u32,
                size: row.get::<_, i64>(2)?.max(0) as u64,
                modified: unix_to_system(row.get::<_, i64>(3)?),
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or(FsError::NotFound)
}

/// Parent of `path` must exist and be a directory.
fn check_parent(conn: &Connection, path: &DavPath) -> FsResult<()> {
    if path.is_root() {
        return Ok(());
    }
    let parent = path.parent();
    let info = stat_row(conn, &parent)?;
    if !info.is_dir {
        return Err(FsError::NotDirectory);
    }
    Ok(())
}

impl SqliteFs {
    /// Open (or create) the database at `path` and run the migration.
    pub fn new(path: &str) -> FsResult<Arc<SqliteFs>> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA auto_vacuum = FULL;
                 PRAGMA journal_mode = WAL;",
            )
        });
        let pool = r2d2::Pool::builder().build(manager).map_err(pool_err)?;

        let conn = pool.get().map_err(pool_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                 path TEXT PRIMARY KEY,     -- unique identifier of the entry
                 is_dir INTEGER NOT NULL,   -- 1 if directory, 0 if file
                 mode INTEGER NOT NULL,     -- permission bits
                 size INTEGER NOT NULL,     -- size in bytes (0 for directories)
                 mtime INTEGER NOT NULL     -- modification time (unix seconds)
             );
             CREATE TABLE IF NOT EXISTS file_contents (
                 path TEXT PRIMARY KEY
                     REFERENCES files(path) ON DELETE CASCADE ON UPDATE CASCADE,
                 content BLOB
             );",
        )
        .map_err(db_err)?;
        conn.execute(
            "INSERT OR IGNORE INTO files (path, is_dir, mode, size, mtime)
             VALUES ('/', 1, 493, 0, ?1)",
            params![now_unix()],
        )
        .map_err(db_err)?;
        drop(conn);

        Ok(Arc::new(SqliteFs { pool }))
    }
}

impl DavFileSystem for SqliteFs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()> {
        let path = path.clone();
        async move {
            trace!("fs(sqlite): mkdir {path:?}");
            with_conn(&self.pool, ctx, move |conn| {
                check_parent(conn, &path)?;
                match stat_row(conn, &path) {
                    Ok(_) => return Err(FsError::Exists),
                    Err(FsError::NotFound) => {}
                    Err(err) => return Err(err),
                }
                conn.execute(
                    "INSERT INTO files (path, is_dir, mode, size, mtime)
                     VALUES (?1, 1, ?2, 0, ?3)",
                    params![path.as_str(), mode as i64, now_unix()],
                )
                .map_err(db_err)?;
                Ok(())
            })
            .await
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
        let path = path.clone();
        async move {
            trace!("fs(sqlite): open {path:?} {flags:?}");
            let open_path = path.clone();
            let info = with_conn(&self.pool, ctx, move |conn| {
                let path = open_path;
                let info = match stat_row(conn, &path) {
                    Ok(info) => {
                        if flags.contains(OpenFlags::CREATE_NEW) {
                            return Err(FsError::Exists);
                        }
                        info
                    }
                    Err(FsError::NotFound) => {
                        if !flags.contains(OpenFlags::CREATE) {
                            return Err(FsError::NotFound);
                        }
                        check_parent(conn, &path)?;
                        // metadata row and content blob are born together
                        let tx = conn.transaction().map_err(db_err)?;
                        tx.execute(
                            "INSERT INTO files (path, is_dir, mode, size, mtime)
                             VALUES (?1, 0, ?2, 0, ?3)",
                            params![path.as_str(), mode as i64, now_unix()],
                        )
                        .map_err(db_err)?;
                        tx.execute(
                            "INSERT INTO file_contents (path, content) VALUES (?1, zeroblob(0))",
                            params![path.as_str()],
                        )
                        .map_err(db_err)?;
                        tx.commit().map_err(db_err)?;
                        stat_row(conn, &path)?
                    }
                    Err(err) => return Err(err),
                };

                if info.is_dir
                    && flags.intersects(
                        OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::TRUNCATE,
                    )
                {
                    return Err(FsError::IsDirectory);
                }

                if !info.is_dir && flags.contains(OpenFlags::TRUNCATE) && info.size > 0 {
                    let tx = conn.transaction().map_err(db_err)?;
                    tx.execute(
                        "UPDATE files SET size = 0, mtime = ?1 WHERE path = ?2",
                        params![now_unix(), path.as_str()],
                    )
                    .map_err(db_err)?;
                    tx.execute(
                        "UPDATE file_contents SET content = zeroblob(0) WHERE path = ?1",
                        params![path.as_str()],
                    )
                    .map_err(db_err)?;
                    tx.commit().map_err(db_err)?;
                    return stat_row(conn, &path);
                }

                Ok(info)
            })
            .await?;

            Ok(Box::new(SqliteFile::new(
                self.pool.clone(),
                ctx.clone(),
                path,
                flags,
                info,
            )) as Box<dyn DavFile>)
        }
        .boxed()
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        let path = path.clone();
        async move {
            trace!("fs(sqlite): remove_all {path:?}");
            with_conn(&self.pool, ctx, move |conn| {
                let info = match stat_row(conn, &path) {
                    Ok(info) => info,
                    Err(FsError::NotFound) => return Ok(()),
                    Err(err) => return Err(err),
                };

                let tx = conn.transaction().map_err(db_err)?;
                if info.is_dir {
                    tx.execute(
                        "DELETE FROM files WHERE path = ?1 OR path LIKE ?2",
                        params![path.as_str(), format!("{}/%", path.as_str())],
                    )
                    .map_err(db_err)?;
                } else {
                    tx.execute("DELETE FROM files WHERE path = ?1", params![path.as_str()])
                        .map_err(db_err)?;
                }
                // file_contents rows follow via ON DELETE CASCADE
                tx.commit().map_err(db_err)?;
                Ok(())
            })
            .await
        }
        .boxed()
    }

    fn rename<'a>(
        &'a self,
        ctx: &'a DavContext,
        from: &'a DavPath,
        to: &'a DavPath,
    ) -> FsFuture<'a, ()> {
        let from = from.clone();
        let to = to.clone();
        async move {
            trace!("fs(sqlite): rename {from:?} {to:?}");
            with_conn(&self.pool, ctx, move |conn| {
                let old_info = stat_row(conn, &from)?;
                match stat_row(conn, &to) {
                    Ok(_) => return Err(FsError::Exists),
                    Err(FsError::NotFound) => {}
                    Err(err) => return Err(err),
                }
                check_parent(conn, &to)?;

                let sp = conn.savepoint().map_err(db_err)?;
                sp.execute(
                    "UPDATE files SET path = ?1 WHERE path = ?2",
                    params![to.as_str(), from.as_str()],
                )
                .map_err(db_err)?;

                if old_info.is_dir {
                    let children: Vec<String> = {
                        let mut stmt = sp
                            .prepare("SELECT path FROM files WHERE path LIKE ?1")
                            .map_err(db_err)?;
                        let rows = stmt
                            .query_map(params![format!("{}/%", from.as_str())], |row| {
                                row.get::<_, String>(0)
                            })
                            .map_err(db_err)?;
                        rows.collect::<Result<_, _>>().map_err(db_err)?
                    };

                    for old_child in children {
                        // single-replacement prefix rewrite
                        let new_child = old_child.replacen(from.as_str(), to.as_str(), 1);
                        sp.execute(
                            "UPDATE files SET path = ?1 WHERE path = ?2",
                            params![new_child, old_child],
                        )
                        .map_err(db_err)?;
                    }
                }

                // file_contents paths follow via ON UPDATE CASCADE
                sp.commit().map_err(db_err)?;
                Ok(())
            })
            .await
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        let path = path.clone();
        async move { with_conn(&self.pool, ctx, move |conn| stat_row(conn, &path)).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fs(dir: &std::path::Path) -> Arc<SqliteFs> {
        SqliteFs::new(dir.join("fs.db").to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_migration_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("fs.db");
        let db = db.to_str().unwrap();
        let _first = SqliteFs::new(db).unwrap();
        let second = SqliteFs::new(db).unwrap();

        let ctx = DavContext::background();
        let root = second.metadata(&ctx, &DavPath::root()).await.unwrap();
        assert!(root.is_dir);
        assert_eq!(root.mode, 0o755);
    }

    #[tokio::test]
    async fn test_mkdir_requires_parent() {
        let dir = tempfile::tempdir().unwrap();
        let fs = open_fs(dir.path());
        let ctx = DavContext::background();

        let err = fs
            .mkdir(&ctx, &DavPath::new("/missing/sub"), 0o755)
            .await
            .unwrap_err();
        assert_eq!(err, FsError::NotFound);

        fs.mkdir(&ctx, &DavPath::new("/a"), 0o755).await.unwrap();
        let err = fs.mkdir(&ctx, &DavPath::new("/a"), 0o755).await.unwrap_err();
        assert_eq!(err, FsError::Exists);
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let fs = open_fs(dir.path());
        let ctx = DavContext::background();

        fs.mkdir(&ctx, &DavPath::new("/a"), 0o755).await.unwrap();
        fs.mkdir(&ctx, &DavPath::new("/b"), 0o755).await.unwrap();
        let err = fs
            .rename(&ctx, &DavPath::new("/a"), &DavPath::new("/b"))
            .await
            .unwrap_err();
        assert_eq!(err, FsError::Exists);
    }
}
