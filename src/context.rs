//! Per-request context.
//!
//! Every backend, lock and store operation receives a [`DavContext`]. It
//! carries the request's cancellation token and the authenticated user (if
//! any). Detached work that must outlive the request — cache pre-population,
//! the S3 upload consumer — runs on [`DavContext::background`] or
//! [`DavContext::detach`] so that it is not torn down with the request.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::authz::User;
use crate::errors::{FsError, FsResult};

#[derive(Clone, Default)]
pub struct DavContext {
    cancel: CancellationToken,
    user: Option<Arc<dyn User>>,
}

impl DavContext {
    /// A context that is never cancelled and carries no user.
    pub fn background() -> DavContext {
        DavContext::default()
    }

    /// A context driven by an externally owned cancellation token.
    pub fn with_cancellation(cancel: CancellationToken) -> DavContext {
        DavContext { cancel, user: None }
    }

    /// Attach the authenticated user for this request.
    pub fn with_user(mut self, user: Arc<dyn User>) -> DavContext {
        self.user = Some(user);
        self
    }

    pub fn user(&self) -> Option<&Arc<dyn User>> {
        self.user.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel all work running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail fast if the request was cancelled.
    ///
    /// Backends call this at operation entry and inside transfer loops.
    pub fn check_cancelled(&self) -> FsResult<()> {
        if self.cancel.is_cancelled() {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A fresh context for detached work: same user, new cancellation token.
    pub fn detach(&self) -> DavContext {
        DavContext {
            cancel: CancellationToken::new(),
            user: self.user.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation() {
        let ctx = DavContext::background();
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel();
        assert_eq!(ctx.check_cancelled(), Err(FsError::Cancelled));
        // a detached context is not affected
        assert!(DavContext::background().detach().check_cancelled().is_ok());
    }

    #[test]
    fn test_detach_survives_parent_cancel() {
        let ctx = DavContext::background();
        let bg = ctx.detach();
        ctx.cancel();
        assert!(bg.check_cancelled().is_ok());
    }
}
