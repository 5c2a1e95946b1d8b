//! The lock system.
//!
//! [`LockSystem`] implements the WebDAV locking protocol over a pluggable
//! [`LockStore`]: lock creation with conflict detection, TTL expiry,
//! depth-zero and depth-infinity scoping, refresh, unlock, and the `confirm`
//! call that decides whether a mutating request is authorized under the
//! locks currently held. The protocol handler calls `confirm` with the
//! client's `If:` condition list before invoking the filesystem chain.
//!
//! All methods take the current time explicitly, which keeps expiry
//! behavior deterministic and testable.

pub mod memls;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::FsFuture;

pub use memls::MemLockStore;

/// What a lock applies to and how.
#[derive(Debug, Clone)]
pub struct LockDetails {
    /// Root path of the lock.
    pub root: DavPath,
    /// Depth zero (the root only) instead of depth infinity (the subtree).
    pub zero_depth: bool,
    /// Exclusive or shared, as requested by the client. Stored and echoed
    /// back; see [`LockSystem::create`] for the conflict rule actually
    /// enforced.
    pub exclusive: bool,
    /// The owner element from the LOCK request body, verbatim XML.
    pub owner_xml: String,
    /// Requested lifetime; zero means infinite.
    pub duration: Duration,
}

/// A live lock.
#[derive(Debug, Clone)]
pub struct LockNode {
    pub token: String,
    pub details: LockDetails,
    /// Absolute expiry; `None` means the lock never expires.
    pub expiry: Option<SystemTime>,
}

impl LockNode {
    pub fn expired(&self, now: SystemTime) -> bool {
        matches!(self.expiry, Some(expiry) if now > expiry)
    }

    /// A lock covers `path` iff `path` is its root, or the lock has depth
    /// infinity and its root is an ancestor of `path`.
    pub fn covers(&self, path: &DavPath) -> bool {
        if self.details.root == *path {
            return true;
        }
        !self.details.zero_depth && self.details.root.is_ancestor_of(path)
    }
}

/// One entry of a (flattened) `If:` condition list.
#[derive(Debug, Clone, Default)]
pub struct Condition {
    pub not: bool,
    pub token: Option<String>,
    pub etag: Option<String>,
}

impl Condition {
    /// A positive token condition: the caller claims to hold this lock.
    pub fn token(token: impl Into<String>) -> Condition {
        Condition {
            not: false,
            token: Some(token.into()),
            etag: None,
        }
    }

    /// A negative token condition: the caller asserts this lock does not
    /// cover the guarded paths.
    pub fn not_token(token: impl Into<String>) -> Condition {
        Condition {
            not: true,
            token: Some(token.into()),
            etag: None,
        }
    }
}

/// Handle returned by a successful [`LockSystem::confirm`].
///
/// The default in-memory store takes no entry out of the table for a
/// confirmation, so releasing is a no-op; stores that hand out short-lived
/// leases can attach real behavior.
#[derive(Debug)]
pub struct LockRelease(());

impl LockRelease {
    pub fn release(self) {}
}

/// Persistence for lock state.
///
/// Token-addressed lookups report a missing token as [`FsError::NotFound`];
/// the system translates that to [`FsError::NoSuchLock`] where appropriate.
pub trait LockStore: Send + Sync + 'static {
    fn get<'a>(&'a self, token: &'a str) -> FsFuture<'a, LockNode>;

    /// Every lock affecting `path`: exact matches plus depth-infinity locks
    /// rooted at an ancestor. Expired locks are included; the caller evicts.
    fn get_by_path<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Vec<LockNode>>;

    /// Insert or replace a lock in the token index and the path index.
    fn apply<'a>(&'a self, node: LockNode) -> FsFuture<'a, ()>;

    fn remove<'a>(&'a self, token: &'a str) -> FsFuture<'a, ()>;
}

/// The lock manager.
pub struct LockSystem {
    store: Arc<dyn LockStore>,
}

fn trim_token(token: &str) -> &str {
    token
        .trim_start_matches('<')
        .trim_end_matches('>')
}

fn new_token() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

impl LockSystem {
    pub fn new(store: Arc<dyn LockStore>) -> LockSystem {
        LockSystem { store }
    }

    /// A lock system over the default in-memory store.
    pub fn in_memory() -> LockSystem {
        LockSystem::new(Arc::new(MemLockStore::new()))
    }

    /// Create a new lock, returning its token.
    ///
    /// Any live lock affecting the root conflicts with any new lock,
    /// regardless of the exclusive/shared flags; finer negotiation is
    /// intentionally not implemented here.
    pub async fn create(&self, now: SystemTime, details: LockDetails) -> FsResult<String> {
        for node in self.store.get_by_path(&details.root).await? {
            if node.expired(now) {
                let _ = self.store.remove(&node.token).await;
                continue;
            }
            return Err(FsError::Locked);
        }

        let token = new_token();
        let expiry = if details.duration > Duration::ZERO {
            Some(now + details.duration)
        } else {
            None
        };

        self.store
            .apply(LockNode {
                token: token.clone(),
                details,
                expiry,
            })
            .await?;

        Ok(token)
    }

    /// Decide whether an operation on `src` (and `dst`, for moves and
    /// copies) is allowed under the currently held locks, given the caller's
    /// condition list.
    pub async fn confirm(
        &self,
        now: SystemTime,
        src: &DavPath,
        dst: Option<&DavPath>,
        conditions: &[Condition],
    ) -> FsResult<LockRelease> {
        let mut paths: Vec<&DavPath> = vec![src];
        if let Some(dst) = dst {
            if dst != src {
                paths.push(dst);
            }
        }

        // Collect the live locks affecting the guarded paths, evicting
        // expired ones as we meet them.
        let mut affecting: HashMap<String, LockNode> = HashMap::new();
        for path in &paths {
            for node in self.store.get_by_path(path).await? {
                if node.expired(now) {
                    let _ = self.store.remove(&node.token).await;
                    continue;
                }
                affecting.insert(node.token.clone(), node);
            }
        }

        if conditions.is_empty() {
            if !affecting.is_empty() {
                return Err(FsError::Locked);
            }
            return Ok(LockRelease(()));
        }

        let mut satisfied: HashSet<String> = HashSet::new();
        let mut has_positive_token = false;
        let mut positive_token_matched = false;

        for condition in conditions {
            let Some(token) = condition.token.as_deref() else {
                // etag-only conditions are evaluated by the protocol
                // handler against resource state, not by the lock table.
                continue;
            };
            let token = trim_token(token);

            let mut node = match self.store.get(token).await {
                Ok(node) => Some(node),
                Err(FsError::NotFound) => None,
                Err(err) => return Err(err),
            };
            if let Some(n) = &node {
                if n.expired(now) {
                    let _ = self.store.remove(token).await;
                    node = None;
                }
            }

            if condition.not {
                // "Not <token>" fails the call if a matching live lock
                // covers any guarded path.
                if let Some(node) = &node {
                    if paths.iter().any(|p| node.covers(p)) {
                        return Err(FsError::Locked);
                    }
                }
            } else {
                has_positive_token = true;
                let Some(node) = &node else { continue };
                if paths.iter().any(|p| node.covers(p)) {
                    satisfied.insert(node.token.clone());
                    positive_token_matched = true;
                }
            }
        }

        // Positive tokens were presented but none named a covering live
        // lock: the caller is holding on to stale tokens.
        if has_positive_token && !positive_token_matched {
            return Err(FsError::NoSuchLock);
        }

        // Every affecting lock must be satisfied by one of the conditions.
        if affecting.keys().any(|token| !satisfied.contains(token)) {
            return Err(FsError::Locked);
        }

        Ok(LockRelease(()))
    }

    /// Extend the lifetime of an existing lock.
    pub async fn refresh(
        &self,
        now: SystemTime,
        token: &str,
        duration: Duration,
    ) -> FsResult<LockDetails> {
        let token = trim_token(token);

        let mut node = match self.store.get(token).await {
            Ok(node) => node,
            Err(FsError::NotFound) => return Err(FsError::NoSuchLock),
            Err(err) => return Err(err),
        };

        if node.expired(now) {
            let _ = self.store.remove(token).await;
            return Err(FsError::NoSuchLock);
        }

        node.details.duration = duration;
        node.expiry = if duration > Duration::ZERO {
            Some(now + duration)
        } else {
            None
        };

        let details = node.details.clone();
        self.store.apply(node).await?;
        Ok(details)
    }

    /// Remove a lock. Unknown or expired tokens fail with `NoSuchLock`.
    pub async fn unlock(&self, now: SystemTime, token: &str) -> FsResult<()> {
        let token = trim_token(token);

        let node = match self.store.get(token).await {
            Ok(node) => node,
            Err(FsError::NotFound) => return Err(FsError::NoSuchLock),
            Err(err) => return Err(err),
        };
        if node.expired(now) {
            let _ = self.store.remove(token).await;
            return Err(FsError::NoSuchLock);
        }

        match self.store.remove(token).await {
            Err(FsError::NotFound) => Err(FsError::NoSuchLock),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(root: &str, zero_depth: bool, duration: Duration) -> LockDetails {
        LockDetails {
            root: DavPath::new(root),
            zero_depth,
            exclusive: true,
            owner_xml: "<D:owner>test</D:owner>".to_string(),
            duration,
        }
    }

    #[tokio::test]
    async fn test_token_format() {
        let ls = LockSystem::in_memory();
        let token = ls
            .create(SystemTime::now(), details("/x", false, Duration::ZERO))
            .await
            .unwrap();
        let hex = token.strip_prefix("urn:uuid:").expect("urn:uuid: prefix");
        let groups: Vec<&str> = hex.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(groups[2].starts_with('4'));
        assert!(matches!(
            groups[3].chars().next().unwrap(),
            '8' | '9' | 'a' | 'b'
        ));
    }

    #[tokio::test]
    async fn test_create_confirm_expiry() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let p = DavPath::new("/d");

        let token = ls
            .create(now, details("/d", false, Duration::from_secs(30)))
            .await
            .unwrap();

        // no conditions: locked
        let err = ls.confirm(now, &p, None, &[]).await.map(|_| ()).unwrap_err();
        assert_eq!(err, FsError::Locked);

        // the matching token: allowed
        ls.confirm(now, &p, None, &[Condition::token(&token)])
            .await
            .unwrap();

        // past expiry the lock is gone
        let later = now + Duration::from_secs(31);
        ls.confirm(later, &p, None, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_depth_infinity_covers_subtree() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let nested = DavPath::new("/a/b");

        let token = ls
            .create(now, details("/a", false, Duration::from_secs(60)))
            .await
            .unwrap();

        let err = ls
            .confirm(now, &nested, None, &[])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Locked);

        ls.confirm(now, &nested, None, &[Condition::token(&token)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_depth_does_not_cover_children() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();

        ls.create(now, details("/a", true, Duration::from_secs(60)))
            .await
            .unwrap();

        // a zero-depth lock at /a does not guard /a/b
        ls.confirm(now, &DavPath::new("/a/b"), None, &[]).await.unwrap();

        let err = ls
            .confirm(now, &DavPath::new("/a"), None, &[])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Locked);
    }

    #[tokio::test]
    async fn test_create_conflict_and_unlock() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let nested = DavPath::new("/d/nested");

        let token = ls
            .create(now, details("/d", false, Duration::from_secs(30)))
            .await
            .unwrap();

        // second lock on the same root conflicts
        let err = ls
            .create(now, details("/d", false, Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert_eq!(err, FsError::Locked);

        ls.confirm(now, &nested, None, &[Condition::token(&token)])
            .await
            .unwrap();

        ls.unlock(now, &token).await.unwrap();
        ls.confirm(now, &nested, None, &[]).await.unwrap();

        // the token is gone now
        assert_eq!(ls.unlock(now, &token).await.unwrap_err(), FsError::NoSuchLock);
    }

    #[tokio::test]
    async fn test_confirm_with_stale_token_only() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let p = DavPath::new("/free");

        // positive tokens that match nothing are an error even on an
        // unlocked path.
        let err = ls
            .confirm(now, &p, None, &[Condition::token("urn:uuid:stale")])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::NoSuchLock);
    }

    #[tokio::test]
    async fn test_confirm_not_condition() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let p = DavPath::new("/n");

        let token = ls
            .create(now, details("/n", false, Duration::from_secs(60)))
            .await
            .unwrap();

        // "Not <token>" where the lock covers the path: refused
        let err = ls
            .confirm(now, &p, None, &[Condition::not_token(&token)])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Locked);

        // "Not <unknown>" passes but does not satisfy the lock either
        let err = ls
            .confirm(now, &p, None, &[Condition::not_token("urn:uuid:none")])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Locked);
    }

    #[tokio::test]
    async fn test_confirm_guards_both_move_paths() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();

        let token = ls
            .create(now, details("/dst", false, Duration::from_secs(60)))
            .await
            .unwrap();

        // source is free but the destination is locked
        let err = ls
            .confirm(now, &DavPath::new("/src"), Some(&DavPath::new("/dst/file")), &[])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Locked);

        ls.confirm(
            now,
            &DavPath::new("/src"),
            Some(&DavPath::new("/dst/file")),
            &[Condition::token(&token)],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let p = DavPath::new("/r");

        let token = ls
            .create(now, details("/r", false, Duration::from_secs(10)))
            .await
            .unwrap();

        let refreshed_at = now + Duration::from_secs(5);
        let refreshed = ls
            .refresh(refreshed_at, &token, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(refreshed.duration, Duration::from_secs(60));

        // well past the original expiry, the lock still holds
        let later = now + Duration::from_secs(30);
        let err = ls.confirm(later, &p, None, &[]).await.map(|_| ()).unwrap_err();
        assert_eq!(err, FsError::Locked);

        // refreshing an expired lock fails
        let way_later = refreshed_at + Duration::from_secs(61);
        assert_eq!(
            ls.refresh(way_later, &token, Duration::from_secs(1))
                .await
                .unwrap_err(),
            FsError::NoSuchLock
        );
    }

    #[tokio::test]
    async fn test_infinite_lock_never_expires() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let p = DavPath::new("/inf");

        ls.create(now, details("/inf", false, Duration::ZERO))
            .await
            .unwrap();

        let much_later = now + Duration::from_secs(360 * 24 * 3600);
        let err = ls
            .confirm(much_later, &p, None, &[])
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Locked);
    }

    #[tokio::test]
    async fn test_angle_bracket_tokens_accepted() {
        let ls = LockSystem::in_memory();
        let now = SystemTime::now();
        let p = DavPath::new("/b");

        let token = ls
            .create(now, details("/b", false, Duration::from_secs(60)))
            .await
            .unwrap();

        ls.confirm(now, &p, None, &[Condition::token(format!("<{token}>"))])
            .await
            .unwrap();
        ls.unlock(now, &format!("<{token}>")).await.unwrap();
    }
}
