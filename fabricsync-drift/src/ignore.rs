//! Server-managed paths excluded from drift comparison.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Paths the cluster owns; never counted as drift.
pub const DEFAULT_IGNORED_PATHS: &[&str] = &[
    "status",
    "resourceVersion",
    "generation",
    "metadata.resourceVersion",
    "metadata.generation",
    "metadata.uid",
    "metadata.managedFields",
    "metadata.creationTimestamp",
];

/// Errors from loading an ignore-set file.
#[derive(Debug, Error)]
pub enum IgnoreSetError {
    #[error("failed to read ignore-set {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse ignore-set {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// A set of dotted paths (`metadata.uid`, `spec.ports[0]`) ignored together
/// with everything below them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreSet {
    paths: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct IgnoreSetFile {
    #[serde(default = "default_true")]
    include_defaults: bool,
    #[serde(default)]
    ignore: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::from_paths(DEFAULT_IGNORED_PATHS.iter().copied())
    }
}

impl IgnoreSet {
    /// An ignore-set that ignores nothing.
    pub fn empty() -> Self {
        Self {
            paths: BTreeSet::new(),
        }
    }

    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.paths.insert(path.into());
        self
    }

    /// Parse `{ include_defaults: bool, ignore: [path, …] }`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let file: IgnoreSetFile = serde_yaml::from_str(yaml)?;
        let base = if file.include_defaults {
            Self::default()
        } else {
            Self::empty()
        };
        Ok(file.ignore.into_iter().fold(base, Self::with_path))
    }

    pub fn load(path: &Path) -> Result<Self, IgnoreSetError> {
        let contents = std::fs::read_to_string(path).map_err(|source| IgnoreSetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&contents).map_err(|source| IgnoreSetError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `path` is ignored when it equals an entry or lies beneath one.
    pub fn is_ignored(&self, path: &str) -> bool {
        self.paths.iter().any(|p| {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('['))
        })
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}
