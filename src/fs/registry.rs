//! Backend registry.
//!
//! An explicit map from type names to filesystem factories, built by the
//! composition root; there are no init-time side effects. Factories take
//! their options as JSON values, decoded into per-backend option structs.

use std::collections::HashMap;
use std::sync::Arc;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::errors::{FsError, FsResult};
use crate::fs::localfs::LocalFs;
use crate::fs::s3fs::S3Fs;
use crate::fs::sqlitefs::SqliteFs;
use crate::fs::DavFileSystem;

pub type FsFactory =
    Box<dyn Fn(&serde_json::Value) -> FsResult<Arc<dyn DavFileSystem>> + Send + Sync>;

pub struct Registry {
    factories: HashMap<String, FsFactory>,
}

fn decode<T: DeserializeOwned>(fs_type: &str, options: &serde_json::Value) -> FsResult<T> {
    serde_json::from_value(options.clone()).map_err(|err| {
        FsError::InvalidArgument(format!("could not parse '{fs_type}' filesystem options: {err}"))
    })
}

/// Options of the local backend.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalOptions {
    /// Base directory; created with mode 0777 if missing.
    pub dir: String,
}

/// Options of the S3 backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Options {
    pub endpoint: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub secure: bool,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    /// `dns` for virtual-hosted addressing, `path` for path-style.
    #[serde(default)]
    pub bucket_lookup: String,
    /// Log requests through the SDK's tracing targets.
    #[serde(default)]
    pub trace: bool,
}

/// Options of the SQLite backend.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteOptions {
    pub path: String,
}

fn build_local(options: &serde_json::Value) -> FsResult<Arc<dyn DavFileSystem>> {
    let opts: LocalOptions = decode("local", options)?;
    std::fs::create_dir_all(&opts.dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&opts.dir, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(LocalFs::new(opts.dir))
}

fn build_s3(options: &serde_json::Value) -> FsResult<Arc<dyn DavFileSystem>> {
    let opts: S3Options = decode("s3", options)?;

    let force_path_style = match opts.bucket_lookup.as_str() {
        "dns" => false,
        "path" => true,
        other => {
            return Err(FsError::InvalidArgument(format!(
                "unknown bucket lookup value '{other}', expected 'dns' or 'path'"
            )))
        }
    };

    let scheme = if opts.secure { "https" } else { "http" };
    let endpoint_url = if opts.endpoint.contains("://") {
        opts.endpoint.clone()
    } else {
        format!("{scheme}://{}", opts.endpoint)
    };

    let region = if opts.region.is_empty() {
        "us-east-1".to_string()
    } else {
        opts.region.clone()
    };
    let session_token = if opts.token.is_empty() {
        None
    } else {
        Some(opts.token.clone())
    };
    let credentials = Credentials::new(opts.user, opts.secret, session_token, None, "static");

    let config = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(region))
        .endpoint_url(endpoint_url)
        .credentials_provider(credentials)
        .force_path_style(force_path_style)
        .build();

    if opts.trace {
        // request-level tracing is emitted on the SDK's own log targets;
        // this only reminds operators where to find it.
        debug!("fs(s3): request tracing is available on the aws_sdk_s3/aws_smithy_runtime targets");
    }

    Ok(S3Fs::new(aws_sdk_s3::Client::from_conf(config), opts.bucket))
}

fn build_sqlite(options: &serde_json::Value) -> FsResult<Arc<dyn DavFileSystem>> {
    let opts: SqliteOptions = decode("sqlite", options)?;
    Ok(SqliteFs::new(&opts.path)? as Arc<dyn DavFileSystem>)
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Registry {
        Registry {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in backends: `local`, `s3`, `sqlite`.
    pub fn with_defaults() -> Registry {
        let mut registry = Registry::new();
        registry.register("local", Box::new(build_local));
        registry.register("s3", Box::new(build_s3));
        registry.register("sqlite", Box::new(build_sqlite));
        registry
    }

    pub fn register(&mut self, fs_type: impl Into<String>, factory: FsFactory) {
        self.factories.insert(fs_type.into(), factory);
    }

    /// Registered type names, sorted.
    pub fn registered(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a backend by type name.
    pub fn build(
        &self,
        fs_type: &str,
        options: &serde_json::Value,
    ) -> FsResult<Arc<dyn DavFileSystem>> {
        let factory = self.factories.get(fs_type).ok_or_else(|| {
            FsError::InvalidArgument(format!("no filesystem registered for type '{fs_type}'"))
        })?;
        factory(options)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registered_names() {
        let registry = Registry::with_defaults();
        assert_eq!(registry.registered(), vec!["local", "s3", "sqlite"]);
    }

    #[test]
    fn test_unknown_type() {
        let registry = Registry::with_defaults();
        let err = match registry.build("ftp", &json!({})) {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[test]
    fn test_local_options_require_dir() {
        let registry = Registry::with_defaults();
        let err = match registry.build("local", &json!({})) {
            Err(err) => err,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[test]
    fn test_build_local_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let registry = Registry::with_defaults();
        registry
            .build("local", &json!({ "dir": dir.to_str().unwrap() }))
            .unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn test_s3_rejects_unknown_bucket_lookup() {
        let registry = Registry::with_defaults();
        let err = registry
            .build(
                "s3",
                &json!({
                    "endpoint": "localhost:9000",
                    "bucket": "b",
                    "bucketLookup": "auto"
                }),
            )
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_build_sqlite() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("x.db");
        let registry = Registry::with_defaults();
        let fs = registry
            .build("sqlite", &json!({ "path": db.to_str().unwrap() }))
            .unwrap();
        let info = fs
            .metadata(
                &crate::context::DavContext::background(),
                &crate::davpath::DavPath::root(),
            )
            .await
            .unwrap();
        assert!(info.is_dir);
    }
}
