//! Validated absolute pathnames.
//!
//! Setup plans describe the container filesystem entirely in terms of
//! absolute pathnames. [`Absolute`] enforces the invariant at the type
//! level: a value can only be constructed from a pathname beginning
//! with `/`, and deserialization performs the same check so a hostile
//! or corrupt plan cannot smuggle a relative pathname past the init.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// Error returned when constructing an [`Absolute`] from a pathname
/// that does not begin with `/`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("path {0:?} is not absolute")]
pub struct AbsoluteError(pub String);

/// A pathname known to be absolute.
///
/// The inner string is stored as given, without resolving symlinks or
/// collapsing dot segments; [`Absolute::append`] and
/// [`Absolute::parent`] operate lexically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Absolute(String);

impl Absolute {
    /// Validates `path` and wraps it.
    pub fn new<S: Into<String>>(path: S) -> Result<Self, AbsoluteError> {
        let path = path.into();
        if path.starts_with('/') {
            Ok(Self(path))
        } else {
            Err(AbsoluteError(path))
        }
    }

    /// Wraps a pathname known at compile time to be absolute.
    pub(crate) fn trusted(path: &'static str) -> Self {
        debug_assert!(path.starts_with('/'));
        Self(path.into())
    }

    /// Returns the pathname as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the pathname as a [`Path`].
    #[must_use]
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }

    /// Appends `elem` lexically, collapsing `.`, `..` and repeated
    /// separators in the result.
    #[must_use]
    pub fn append(&self, elem: &str) -> Self {
        let mut parts: Vec<&str> = Vec::new();
        for part in self.0.split('/').chain(elem.split('/')) {
            match part {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                p => parts.push(p),
            }
        }
        let mut joined = String::with_capacity(self.0.len() + elem.len() + 1);
        joined.push('/');
        joined.push_str(&parts.join("/"));
        Self(joined)
    }

    /// Returns the lexical parent directory; the parent of `/` is `/`.
    #[must_use]
    pub fn parent(&self) -> Self {
        self.append("..")
    }
}

/// Sorts `paths` and removes adjacent duplicates.
pub fn sort_compact(paths: &mut Vec<Absolute>) {
    paths.sort();
    paths.dedup();
}

impl fmt::Display for Absolute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Absolute {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<Path> for Absolute {
    fn as_ref(&self) -> &Path {
        self.as_path()
    }
}

impl AsRef<OsStr> for Absolute {
    fn as_ref(&self) -> &OsStr {
        OsStr::new(&self.0)
    }
}

impl Serialize for Absolute {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Absolute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let path = String::deserialize(deserializer)?;
        Self::new(path).map_err(de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_absolute() {
        let a = Absolute::new("/etc/passwd").unwrap();
        assert_eq!(a.as_str(), "/etc/passwd");
    }

    #[test]
    fn rejects_relative_and_empty() {
        assert_eq!(
            Absolute::new("etc/passwd").unwrap_err(),
            AbsoluteError("etc/passwd".into())
        );
        assert!(Absolute::new("").is_err());
        assert!(Absolute::new("./x").is_err());
    }

    #[test]
    fn construction_is_idempotent() {
        let a = Absolute::new("/var//log/.").unwrap();
        let b = Absolute::new(a.as_str()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn append_cleans() {
        let a = Absolute::new("/etc").unwrap();
        assert_eq!(a.append("os-release").as_str(), "/etc/os-release");
        assert_eq!(a.append("./x//y").as_str(), "/etc/x/y");
        assert_eq!(a.append("..").as_str(), "/");
        assert_eq!(a.append("../../..").as_str(), "/");
    }

    #[test]
    fn parent_of_root_is_root() {
        let root = Absolute::new("/").unwrap();
        assert_eq!(root.parent().as_str(), "/");
        assert_eq!(
            Absolute::new("/a/b/c").unwrap().parent().as_str(),
            "/a/b"
        );
    }

    #[test]
    fn serde_rejects_relative() {
        let a = Absolute::new("/bin/sh").unwrap();
        let bytes = postcard::to_allocvec(&a).unwrap();
        let back: Absolute = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(a, back);

        let bytes = postcard::to_allocvec("bin/sh").unwrap();
        assert!(postcard::from_bytes::<Absolute>(&bytes).is_err());
    }

    #[test]
    fn sort_compact_orders_and_dedups() {
        let mut v = vec![
            Absolute::new("/b").unwrap(),
            Absolute::new("/a").unwrap(),
            Absolute::new("/b").unwrap(),
        ];
        sort_compact(&mut v);
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].as_str(), "/a");
        assert_eq!(v[1].as_str(), "/b");
    }
}
