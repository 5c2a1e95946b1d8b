//! ## Pluggable WebDAV filesystem core
//!
//! [`Webdav`] (RFC4918) is HTTP plus a bunch of extension methods used to
//! manage collections, get information on them, rename and copy items,
//! lock/unlock items, etc. This library is the storage side of such a
//! server: a virtual filesystem contract with pluggable backends, a lock
//! system implementing the WebDAV locking protocol, and a middleware stack
//! for the cross-cutting concerns around them. The HTTP/XML framing is the
//! job of a protocol handler built on top; it talks to this crate through
//! [`DavHandler`], which routes each WebDAV verb to the filesystem chain
//! and consults the lock system first.
//!
//! ## Backend interfaces.
//!
//! The interfaces are similar to the ones from the Go `x/net/webdav`
//! package:
//!
//! - you supply a [filesystem][fs::DavFileSystem] for backend storage
//! - you can supply a [locksystem][ls::LockSystem] that handles webdav locks
//!
//! Three filesystems are included:
//!
//! - [`fs::localfs::LocalFs`]: serves a directory on the local filesystem
//! - [`fs::s3fs::S3Fs`]: serves an S3 bucket, mapping the flat keyspace to
//!   a hierarchy with directory markers and streaming multipart uploads
//! - [`fs::sqlitefs::SqliteFs`]: serves a single SQLite database, with
//!   contents streamed through incremental blob I/O
//!
//! Backends can also be built from configuration through the
//! [registry][fs::registry::Registry].
//!
//! ## Middlewares.
//!
//! A [`Middleware`] wraps a filesystem and returns a filesystem, so the
//! stack composes with [`chain`]:
//!
//! - [`authz`]: rule-based authorization (first matching rule grants,
//!   default deny)
//! - [`cache`]: metadata cache with single-flight coalescing,
//!   write-through invalidation and background listing pre-population
//! - [`props`]: dead-property storage that follows renames and removals
//! - [`logger`]: per-operation logging
//!
//! ## Example.
//!
//! Serve a local directory with locks, caching and dead properties:
//!
//! ```no_run
//! use std::time::Duration;
//! use dav_core::fs::localfs::LocalFs;
//! use dav_core::cache::{self, MemCacheStore};
//! use dav_core::props::{self, MemPropStore};
//! use dav_core::ls::LockSystem;
//! use dav_core::DavHandler;
//!
//! #[tokio::main]
//! async fn main() {
//!     let handler = DavHandler::builder(LocalFs::new("/srv/dav"))
//!         .middleware(cache::middleware(MemCacheStore::new(Duration::from_secs(60))))
//!         .middleware(props::middleware(MemPropStore::new()))
//!         .locksystem(LockSystem::in_memory())
//!         .build();
//!
//!     // hand `handler` to the protocol layer; each WebDAV verb maps to
//!     // one of its methods.
//!     let ctx = dav_core::DavContext::background();
//!     let root = handler.stat(&ctx, &"/".into()).await.unwrap();
//!     println!("root is a directory: {}", root.is_dir);
//! }
//! ```
//!
//! [`Webdav`]: http://www.webdav.org/

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod authz;
pub mod cache;
mod context;
mod davhandler;
pub mod davpath;
mod errors;
pub mod fs;
pub mod logger;
mod middleware;
pub mod props;
pub mod ls;
mod singleflight;
mod util;

pub use crate::context::DavContext;
pub use crate::davhandler::{DavBuilder, DavHandler};
pub use crate::davpath::DavPath;
pub use crate::errors::{FsError, FsResult};
pub use crate::middleware::{chain, Middleware};
pub use crate::util::DavMethod;
