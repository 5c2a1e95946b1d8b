//! Expression rules.
//!
//! [`ExprRule`] evaluates a boolean `rhai` expression against the call
//! environment. Compiled programs are cached by script text with a one-hour
//! TTL; the cache is shared across all users.
//!
//! The scope exposes `operation`, `name`, `new_name`, `flag`, `perm`, the
//! `user` attribute map and the `groups` array, plus `OP_*` and `O_*`
//! constants so rules read like:
//!
//! ```text
//! operation == OP_OPEN && (flag & O_WRITE) == 0
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rhai::{Dynamic, Engine, Scope, AST};

use crate::authz::{Rule, RuleEnv, OP_MKDIR, OP_OPEN, OP_REMOVE, OP_RENAME, OP_STAT};
use crate::errors::{FsError, FsResult};
use crate::fs::OpenFlags;

lazy_static! {
    static ref ENGINE: Engine = {
        let mut engine = Engine::new();
        // rules are expressions; no need for loops or functions
        engine.set_max_operations(10_000);
        engine
    };
    static ref DEFAULT_CACHE: ProgramCache = ProgramCache::new(Duration::from_secs(3600));
}

struct CachedProgram {
    ast: AST,
    expires: Instant,
}

/// Script-text keyed compilation cache with a fixed TTL.
pub struct ProgramCache {
    ttl: Duration,
    programs: Mutex<HashMap<String, CachedProgram>>,
}

impl ProgramCache {
    pub fn new(ttl: Duration) -> ProgramCache {
        ProgramCache {
            ttl,
            programs: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, script: &str) -> FsResult<AST> {
        let now = Instant::now();
        if let Some(cached) = self.programs.lock().get(script) {
            if cached.expires > now {
                return Ok(cached.ast.clone());
            }
        }

        let ast = ENGINE.compile_expression(script).map_err(|err| {
            FsError::InvalidArgument(format!("could not compile rule '{script}': {err}"))
        })?;

        self.programs.lock().insert(
            script.to_string(),
            CachedProgram {
                ast: ast.clone(),
                expires: now + self.ttl,
            },
        );

        Ok(ast)
    }
}

/// A rule backed by a compiled boolean expression.
pub struct ExprRule {
    script: String,
}

impl ExprRule {
    pub fn new(script: impl Into<String>) -> ExprRule {
        ExprRule {
            script: script.into(),
        }
    }

    pub fn script(&self) -> &str {
        &self.script
    }
}

fn build_scope(env: &RuleEnv) -> FsResult<Scope<'static>> {
    let user: Dynamic =
        rhai::serde::to_dynamic(serde_json::Value::Object(env.attrs.clone())).map_err(|err| {
            FsError::InvalidArgument(format!("could not convert user attributes: {err}"))
        })?;
    let groups: Dynamic = rhai::serde::to_dynamic(env.groups.clone())
        .map_err(|err| FsError::InvalidArgument(format!("could not convert groups: {err}")))?;

    let mut scope = Scope::new();
    scope.push_constant("operation", env.operation.to_string());
    scope.push_constant("name", env.name.clone());
    scope.push_constant("new_name", env.new_name.clone());
    scope.push_constant("flag", env.flag.bits() as i64);
    scope.push_constant("perm", env.perm as i64);
    scope.push_constant("user", user);
    scope.push_constant("groups", groups);

    scope.push_constant("OP_MKDIR", OP_MKDIR.to_string());
    scope.push_constant("OP_OPEN", OP_OPEN.to_string());
    scope.push_constant("OP_REMOVE", OP_REMOVE.to_string());
    scope.push_constant("OP_RENAME", OP_RENAME.to_string());
    scope.push_constant("OP_STAT", OP_STAT.to_string());

    scope.push_constant("O_RDONLY", OpenFlags::READ.bits() as i64);
    scope.push_constant("O_WRONLY", OpenFlags::WRITE.bits() as i64);
    scope.push_constant(
        "O_RDWR",
        (OpenFlags::READ | OpenFlags::WRITE).bits() as i64,
    );
    scope.push_constant("O_APPEND", OpenFlags::APPEND.bits() as i64);
    scope.push_constant("O_CREATE", OpenFlags::CREATE.bits() as i64);
    scope.push_constant("O_EXCL", OpenFlags::CREATE_NEW.bits() as i64);
    scope.push_constant("O_TRUNC", OpenFlags::TRUNCATE.bits() as i64);
    // every flag that can mutate the target
    scope.push_constant("O_WRITE", OpenFlags::WRITE_MASK.bits() as i64);

    Ok(scope)
}

impl Rule for ExprRule {
    fn eval(&self, env: &RuleEnv) -> FsResult<bool> {
        let ast = DEFAULT_CACHE.get(&self.script)?;
        let mut scope = build_scope(env)?;
        ENGINE
            .eval_ast_with_scope::<bool>(&mut scope, &ast)
            .map_err(|err| {
                FsError::InvalidArgument(format!(
                    "rule '{}' did not evaluate to a boolean: {err}",
                    self.script
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(operation: &'static str, flag: OpenFlags) -> RuleEnv {
        RuleEnv {
            operation,
            name: "/f".to_string(),
            new_name: String::new(),
            flag,
            perm: 0o644,
            attrs: serde_json::Map::new(),
            groups: vec!["staff".to_string()],
        }
    }

    #[test]
    fn test_flag_mask_expression() {
        let rule = ExprRule::new("operation == OP_OPEN && (flag & O_WRITE) == 0");
        assert!(rule.eval(&env(OP_OPEN, OpenFlags::READ)).unwrap());
        assert!(!rule
            .eval(&env(
                OP_OPEN,
                OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE
            ))
            .unwrap());
        assert!(!rule.eval(&env(OP_STAT, OpenFlags::empty())).unwrap());
    }

    #[test]
    fn test_groups_membership() {
        let rule = ExprRule::new(r#""staff" in groups"#);
        assert!(rule.eval(&env(OP_STAT, OpenFlags::empty())).unwrap());
        let rule = ExprRule::new(r#""admins" in groups"#);
        assert!(!rule.eval(&env(OP_STAT, OpenFlags::empty())).unwrap());
    }

    #[test]
    fn test_non_boolean_result_is_an_error() {
        let rule = ExprRule::new("1 + 1");
        assert!(matches!(
            rule.eval(&env(OP_STAT, OpenFlags::empty())),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compile_error() {
        let rule = ExprRule::new("operation ==");
        assert!(matches!(
            rule.eval(&env(OP_STAT, OpenFlags::empty())),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_path_prefix_rule() {
        let rule = ExprRule::new(r#"name.starts_with("/public/")"#);
        let mut e = env(OP_STAT, OpenFlags::empty());
        e.name = "/public/doc".to_string();
        assert!(rule.eval(&e).unwrap());
        e.name = "/private/doc".to_string();
        assert!(!rule.eval(&e).unwrap());
    }
}
