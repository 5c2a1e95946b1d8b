//! Middleware composition.
//!
//! A middleware takes a filesystem and returns a filesystem with the same
//! contract. [`chain`] folds a list of wrappers leaf-to-root, so the first
//! middleware in the list is the outermost one.

use std::sync::Arc;

use crate::fs::DavFileSystem;

pub type Middleware = Box<dyn Fn(Arc<dyn DavFileSystem>) -> Arc<dyn DavFileSystem> + Send + Sync>;

pub fn chain(fs: Arc<dyn DavFileSystem>, middlewares: Vec<Middleware>) -> Arc<dyn DavFileSystem> {
    let mut fs = fs;
    for middleware in middlewares.into_iter().rev() {
        fs = middleware(fs);
    }
    fs
}
