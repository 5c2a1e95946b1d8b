//! Normalized webdav paths.
//!
//! All filesystems, the lock system and the property stores operate on
//! [`DavPath`] values: slash-delimited, rooted at `/`, case sensitive, with
//! no trailing slash (except the root itself) and no relative segments.
//! Normalization is purely lexical and happens at construction time, so a
//! `DavPath` can never escape the tree it addresses.

use std::fmt;
use std::path::Path;

/// An absolute, normalized slash path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DavPath(String);

impl DavPath {
    /// Build a path from arbitrary input.
    ///
    /// The empty string maps to `/`, duplicate slashes collapse, `.` is
    /// dropped and `..` pops the previous segment (never above the root).
    pub fn new(path: &str) -> DavPath {
        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                other => segments.push(other),
            }
        }
        if segments.is_empty() {
            DavPath("/".to_string())
        } else {
            DavPath(format!("/{}", segments.join("/")))
        }
    }

    /// The root path `/`.
    pub fn root() -> DavPath {
        DavPath("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Final path segment; `/` for the root itself.
    pub fn name(&self) -> &str {
        if self.is_root() {
            "/"
        } else {
            self.0.rsplit('/').next().unwrap_or("")
        }
    }

    /// Parent path; the root is its own parent.
    pub fn parent(&self) -> DavPath {
        if self.is_root() {
            return self.clone();
        }
        match self.0.rfind('/') {
            Some(0) | None => DavPath::root(),
            Some(idx) => DavPath(self.0[..idx].to_string()),
        }
    }

    /// Append one or more segments, re-normalizing the result.
    pub fn join(&self, name: &str) -> DavPath {
        DavPath::new(&format!("{}/{}", self.0, name))
    }

    /// True if `other` lives strictly below this path.
    ///
    /// This is the lock coverage rule for depth-infinity locks: a proper
    /// prefix followed by a slash.
    pub fn is_ancestor_of(&self, other: &DavPath) -> bool {
        if self == other {
            return false;
        }
        if self.is_root() {
            return true;
        }
        other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/')
    }

    /// The path relative to the root, usable below an OS base directory.
    pub fn as_rel_ospath(&self) -> &Path {
        Path::new(self.0.trim_start_matches('/'))
    }
}

impl From<&str> for DavPath {
    fn from(path: &str) -> DavPath {
        DavPath::new(path)
    }
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(DavPath::new("").as_str(), "/");
        assert_eq!(DavPath::new("/").as_str(), "/");
        assert_eq!(DavPath::new("a/b").as_str(), "/a/b");
        assert_eq!(DavPath::new("/a/b/").as_str(), "/a/b");
        assert_eq!(DavPath::new("//a///b").as_str(), "/a/b");
        assert_eq!(DavPath::new("/a/./b").as_str(), "/a/b");
        assert_eq!(DavPath::new("/a/../b").as_str(), "/b");
        assert_eq!(DavPath::new("/../../a").as_str(), "/a");
        assert_eq!(DavPath::new("/a/b/..").as_str(), "/a");
    }

    #[test]
    fn test_parent_and_name() {
        let p = DavPath::new("/a/b/c");
        assert_eq!(p.name(), "c");
        assert_eq!(p.parent().as_str(), "/a/b");
        assert_eq!(DavPath::new("/a").parent().as_str(), "/");
        assert_eq!(DavPath::root().parent().as_str(), "/");
        assert_eq!(DavPath::root().name(), "/");
    }

    #[test]
    fn test_ancestor() {
        let root = DavPath::root();
        let a = DavPath::new("/a");
        let ab = DavPath::new("/a/b");
        let abc = DavPath::new("/a/bc");
        assert!(root.is_ancestor_of(&a));
        assert!(a.is_ancestor_of(&ab));
        assert!(!a.is_ancestor_of(&a));
        // prefix match alone is not enough: "/a/b" does not cover "/a/bc"
        assert!(!ab.is_ancestor_of(&abc));
        assert!(!ab.is_ancestor_of(&a));
    }

    #[test]
    fn test_join() {
        assert_eq!(DavPath::new("/a").join("b/c").as_str(), "/a/b/c");
        assert_eq!(DavPath::root().join("x").as_str(), "/x");
    }
}
