//! Rule-based authorization middleware.
//!
//! Every user owns an ordered list of rules. Before each filesystem
//! operation the middleware assembles an environment describing the call
//! and evaluates the user's rules in order. The first rule returning `true`
//! grants access; if none does — or no user is attached to the request
//! context — the operation fails with `Forbidden`. Group membership is
//! exposed to rules as queryable data (the `groups` name list), not as an
//! extra rule source.

pub mod expr;

use std::sync::Arc;

use futures_util::FutureExt;

use crate::context::DavContext;
use crate::davpath::DavPath;
use crate::errors::{FsError, FsResult};
use crate::fs::{DavFile, DavFileSystem, FileInfo, FsFuture, OpenFlags};
use crate::middleware::Middleware;
use crate::props::{DavProp, PropPatch, PropStat};

pub use expr::ExprRule;

/// Operation names as seen by rules.
pub const OP_MKDIR: &str = "mkdir";
pub const OP_OPEN: &str = "open";
pub const OP_REMOVE: &str = "remove";
pub const OP_RENAME: &str = "rename";
pub const OP_STAT: &str = "stat";

/// The call environment a rule evaluates against.
#[derive(Debug, Clone)]
pub struct RuleEnv {
    pub operation: &'static str,
    pub name: String,
    /// Rename destination, empty otherwise.
    pub new_name: String,
    /// Open flags; empty for non-open operations.
    pub flag: OpenFlags,
    /// Permission bits of the call; zero when not applicable.
    pub perm: u32,
    /// Free-form user attributes.
    pub attrs: serde_json::Map<String, serde_json::Value>,
    /// Names of the groups the user belongs to.
    pub groups: Vec<String>,
}

/// A single authorization rule.
pub trait Rule: Send + Sync {
    fn eval(&self, env: &RuleEnv) -> FsResult<bool>;
}

/// An authenticated user: attributes, group memberships and rules.
pub trait User: Send + Sync {
    fn username(&self) -> &str;
    fn attrs(&self) -> serde_json::Map<String, serde_json::Value>;
    fn groups(&self) -> Vec<Group>;
    fn rules(&self) -> Vec<Arc<dyn Rule>>;
}

/// A named group.
///
/// The middleware never evaluates a group's rules; only the user's own set
/// decides. Membership appears to rule scripts as the `groups` name list.
#[derive(Clone)]
pub struct Group {
    name: String,
    rules: Vec<Arc<dyn Rule>>,
}

impl Group {
    pub fn new(name: impl Into<String>, rules: Vec<Arc<dyn Rule>>) -> Group {
        Group {
            name: name.into(),
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Arc<dyn Rule>] {
        &self.rules
    }
}

/// A plain [`User`] built from static data, for composition roots and tests.
pub struct StaticUser {
    username: String,
    attrs: serde_json::Map<String, serde_json::Value>,
    groups: Vec<Group>,
    rules: Vec<Arc<dyn Rule>>,
}

impl StaticUser {
    pub fn new(username: impl Into<String>) -> StaticUser {
        let username = username.into();
        let mut attrs = serde_json::Map::new();
        attrs.insert("name".to_string(), serde_json::Value::String(username.clone()));
        StaticUser {
            username,
            attrs,
            groups: Vec::new(),
            rules: Vec::new(),
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: serde_json::Value) -> StaticUser {
        self.attrs.insert(key.into(), value);
        self
    }

    pub fn group(mut self, group: Group) -> StaticUser {
        self.groups.push(group);
        self
    }

    pub fn rule(mut self, rule: Arc<dyn Rule>) -> StaticUser {
        self.rules.push(rule);
        self
    }
}

impl User for StaticUser {
    fn username(&self) -> &str {
        &self.username
    }

    fn attrs(&self) -> serde_json::Map<String, serde_json::Value> {
        self.attrs.clone()
    }

    fn groups(&self) -> Vec<Group> {
        self.groups.clone()
    }

    fn rules(&self) -> Vec<Arc<dyn Rule>> {
        self.rules.clone()
    }
}

/// The authorizing filesystem wrapper.
pub struct AuthzFs {
    backend: Arc<dyn DavFileSystem>,
}

impl AuthzFs {
    pub fn new(backend: Arc<dyn DavFileSystem>) -> Arc<AuthzFs> {
        Arc::new(AuthzFs { backend })
    }

    fn assert(
        &self,
        ctx: &DavContext,
        operation: &'static str,
        name: &DavPath,
        new_name: Option<&DavPath>,
        flag: OpenFlags,
        perm: u32,
    ) -> FsResult<()> {
        let Some(user) = ctx.user() else {
            // "no user in context" is a permission failure, not a bug.
            return Err(FsError::Forbidden);
        };

        let env = RuleEnv {
            operation,
            name: name.as_str().to_string(),
            new_name: new_name.map(|p| p.as_str().to_string()).unwrap_or_default(),
            flag,
            perm,
            attrs: user.attrs(),
            groups: user
                .groups()
                .iter()
                .map(|g| g.name().to_string())
                .collect(),
        };

        for rule in user.rules() {
            if rule.eval(&env)? {
                trace!("authz: {} {} allowed for {}", operation, name, user.username());
                return Ok(());
            }
        }

        debug!("authz: {} {} denied for {}", operation, name, user.username());
        Err(FsError::Forbidden)
    }
}

/// Middleware enforcing per-user rules on every operation.
pub fn middleware() -> Middleware {
    Box::new(|next| AuthzFs::new(next))
}

impl DavFileSystem for AuthzFs {
    fn mkdir<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath, mode: u32) -> FsFuture<'a, ()> {
        async move {
            self.assert(ctx, OP_MKDIR, path, None, OpenFlags::empty(), mode)?;
            self.backend.mkdir(ctx, path, mode).await
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
            self.assert(ctx, OP_OPEN, path, None, flags, mode)?;
            self.backend.open(ctx, path, flags, mode).await
        }
        .boxed()
    }

    fn remove_all<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, ()> {
        async move {
            self.assert(ctx, OP_REMOVE, path, None, OpenFlags::empty(), 0)?;
            self.backend.remove_all(ctx, path).await
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
            self.assert(ctx, OP_RENAME, from, Some(to), OpenFlags::empty(), 0)?;
            self.backend.rename(ctx, from, to).await
        }
        .boxed()
    }

    fn metadata<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, FileInfo> {
        async move {
            self.assert(ctx, OP_STAT, path, None, OpenFlags::empty(), 0)?;
            self.backend.metadata(ctx, path).await
        }
        .boxed()
    }

    fn get_props<'a>(&'a self, ctx: &'a DavContext, path: &'a DavPath) -> FsFuture<'a, Vec<DavProp>> {
        self.backend.get_props(ctx, path)
    }

    fn patch_props<'a>(
        &'a self,
        ctx: &'a DavContext,
        path: &'a DavPath,
        patches: Vec<PropPatch>,
    ) -> FsFuture<'a, Vec<PropStat>> {
        self.backend.patch_props(ctx, path, patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::localfs::LocalFs;

    fn authz_over_tempdir(dir: &std::path::Path) -> Arc<AuthzFs> {
        AuthzFs::new(LocalFs::new(dir))
    }

    fn ctx_with(user: StaticUser) -> DavContext {
        DavContext::background().with_user(Arc::new(user))
    }

    #[tokio::test]
    async fn test_no_user_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let fs = authz_over_tempdir(dir.path());
        let err = fs
            .metadata(&DavContext::background(), &DavPath::root())
            .await
            .unwrap_err();
        assert_eq!(err, FsError::Forbidden);
    }

    #[tokio::test]
    async fn test_zero_rules_deny_everything() {
        let dir = tempfile::tempdir().unwrap();
        let fs = authz_over_tempdir(dir.path());
        let ctx = ctx_with(StaticUser::new("alice"));

        assert_eq!(
            fs.metadata(&ctx, &DavPath::root()).await.unwrap_err(),
            FsError::Forbidden
        );
        assert_eq!(
            fs.mkdir(&ctx, &DavPath::new("/x"), 0o755).await.unwrap_err(),
            FsError::Forbidden
        );
    }

    #[tokio::test]
    async fn test_read_only_rule() {
        let dir = tempfile::tempdir().unwrap();
        let fs = authz_over_tempdir(dir.path());
        let rule: Arc<dyn Rule> = Arc::new(ExprRule::new(
            r#"operation == OP_STAT || (operation == OP_OPEN && (flag & O_WRITE) == 0)"#,
        ));
        let ctx = ctx_with(StaticUser::new("bob").rule(rule));

        fs.metadata(&ctx, &DavPath::root()).await.unwrap();
        // read-only open allowed, even of a missing file (fails later, in
        // the backend, not in authz)
        let err = fs
            .open(&ctx, &DavPath::new("/nope"), OpenFlags::READ, 0)
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::NotFound);

        let err = fs
            .open(
                &ctx,
                &DavPath::new("/f"),
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
                0o644,
            )
            .await
            .map(|_| ())
            .unwrap_err();
        assert_eq!(err, FsError::Forbidden);
    }

    #[tokio::test]
    async fn test_group_membership_is_rule_data_not_a_grant() {
        let dir = tempfile::tempdir().unwrap();
        let fs = authz_over_tempdir(dir.path());
        let rule: Arc<dyn Rule> = Arc::new(ExprRule::new(r#""admins" in groups"#));

        // a user-owned rule may query group membership
        let admin = ctx_with(
            StaticUser::new("carol")
                .group(Group::new("admins", Vec::new()))
                .rule(rule.clone()),
        );
        fs.mkdir(&admin, &DavPath::new("/made-by-admin"), 0o755)
            .await
            .unwrap();

        let outsider = ctx_with(StaticUser::new("dave").rule(rule));
        assert_eq!(
            fs.mkdir(&outsider, &DavPath::new("/denied"), 0o755)
                .await
                .unwrap_err(),
            FsError::Forbidden
        );

        // rules attached to a group are never evaluated: a user with no
        // rules of their own stays denied, member or not
        let always: Arc<dyn Rule> = Arc::new(ExprRule::new("true"));
        let member = ctx_with(
            StaticUser::new("erin").group(Group::new("admins", vec![always])),
        );
        assert_eq!(
            fs.mkdir(&member, &DavPath::new("/also-denied"), 0o755)
                .await
                .unwrap_err(),
            FsError::Forbidden
        );
    }

    #[tokio::test]
    async fn test_attr_based_rule() {
        let dir = tempfile::tempdir().unwrap();
        let fs = authz_over_tempdir(dir.path());
        let rule: Arc<dyn Rule> = Arc::new(ExprRule::new(r#"user.role == "editor""#));

        let editor = ctx_with(
            StaticUser::new("dora")
                .attr("role", serde_json::Value::String("editor".into()))
                .rule(rule.clone()),
        );
        fs.metadata(&editor, &DavPath::root()).await.unwrap();

        let viewer = ctx_with(
            StaticUser::new("eve")
                .attr("role", serde_json::Value::String("viewer".into()))
                .rule(rule),
        );
        assert_eq!(
            fs.metadata(&viewer, &DavPath::root()).await.unwrap_err(),
            FsError::Forbidden
        );
    }
}
