//! Watched path normalization.
//!
//! A [`WatchedPath`] is the identity key for subscriptions: a normalized
//! relative path under the source root. Two paths are the same entity iff
//! their normalized strings are equal.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Rejection reasons for a viewer-supplied path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute paths are not allowed")]
    Absolute,
    #[error("path escapes the source root")]
    Traversal,
}

/// Normalized relative filename under the source root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchedPath(String);

impl WatchedPath {
    /// Normalize a viewer-supplied relative path.
    ///
    /// `./` segments are dropped; `..` and absolute paths are rejected
    /// outright rather than resolved.
    pub fn new(raw: &str) -> Result<Self, PathError> {
        if raw.trim().is_empty() {
            return Err(PathError::Empty);
        }

        let mut segments = Vec::new();
        for component in Path::new(raw).components() {
            match component {
                Component::Normal(seg) => segments.push(seg.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => return Err(PathError::Traversal),
                Component::RootDir | Component::Prefix(_) => return Err(PathError::Absolute),
            }
        }

        if segments.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(Self(segments.join("/")))
    }

    /// Relative form of an absolute path under `root`, if it is under it.
    pub fn from_absolute(root: &Path, absolute: &Path) -> Option<Self> {
        let relative = absolute.strip_prefix(root).ok()?;
        Self::new(&relative.to_string_lossy()).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path segment (used for scratch staging and extension lookup).
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Absolute location under the source root.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.0)
    }
}

impl fmt::Display for WatchedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
