//! Allow list of proposal ids loaded from a plain text file.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AllowListError {
    #[error("allow list {} not found", .0.display())]
    Missing(PathBuf),
    #[error("reading allow list {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How the allow list in use came to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllowListOrigin {
    Loaded { path: PathBuf },
    Missing { path: PathBuf },
    Unreadable { path: PathBuf, reason: String },
    Inline,
}

/// Proposal ids of interest, one per line in the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowList {
    ids: HashSet<String>,
    origin: AllowListOrigin,
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            ids: HashSet::new(),
            origin: AllowListOrigin::Inline,
        }
    }
}

impl AllowList {
    pub fn parse(text: &str) -> HashSet<String> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            origin: AllowListOrigin::Inline,
        }
    }

    pub fn load(path: &Path) -> Result<Self, AllowListError> {
        let text = std::fs::read_to_string(path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => AllowListError::Missing(path.to_path_buf()),
            _ => AllowListError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let ids = Self::parse(&text);
        info!(path = %path.display(), entries = ids.len(), "loaded allow list");
        Ok(Self {
            ids,
            origin: AllowListOrigin::Loaded {
                path: path.to_path_buf(),
            },
        })
    }

    /// Like [`AllowList::load`], but a missing or unreadable file degrades to
    /// an empty list with a warning.
    pub fn load_or_empty(path: &Path) -> Self {
        match Self::load(path) {
            Ok(list) => list,
            Err(err) => {
                warn!(%err, "continuing with an empty allow list");
                let origin = match err {
                    AllowListError::Missing(path) => AllowListOrigin::Missing { path },
                    AllowListError::Io { path, source } => AllowListOrigin::Unreadable {
                        path,
                        reason: source.to_string(),
                    },
                };
                Self {
                    ids: HashSet::new(),
                    origin,
                }
            }
        }
    }

    pub fn contains(&self, proposal_id: &str) -> bool {
        self.ids.contains(proposal_id.trim())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn origin(&self) -> &AllowListOrigin {
        &self.origin
    }
}
