//! Remote object storage collaborator
//!
//! The core never speaks a network protocol itself; it asks a remote
//! whether content exists. The contract is tri-state by construction:
//! present (in the returned set), absent (not in it), or unknown — a
//! transport failure returns `Err` and is never collapsed into "absent",
//! because a false negative would let checkout declare data unrecoverable
//! or GC delete live objects.

use crate::areas::odb::Odb;
use crate::artifacts::core::default_jobs;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("remote storage unreachable: {reason}")]
pub struct RemoteUnavailable {
    pub reason: String,
}

/// `Sync` because checkout holds its remote across the worker pool.
pub trait Remote: Sync {
    /// Subset of `values` present on the remote. `Err` means the check
    /// could not be completed, not that the objects are absent.
    fn exists_batch(&self, values: &[String]) -> anyhow::Result<HashSet<String>>;
}

/// Filesystem-backed remote: a second object database on another volume
/// (site-wide cache, network mount, or a test double).
#[derive(Debug)]
pub struct FsRemote {
    odb: Odb,
}

impl FsRemote {
    pub fn new(root: &Path) -> Self {
        FsRemote {
            odb: Odb::new(root.to_path_buf().into_boxed_path()),
        }
    }

    pub fn odb(&self) -> &Odb {
        &self.odb
    }
}

impl Remote for FsRemote {
    fn exists_batch(&self, values: &[String]) -> anyhow::Result<HashSet<String>> {
        if !self.odb.root().is_dir() {
            return Err(RemoteUnavailable {
                reason: format!("no such directory: {}", self.odb.root().display()),
            }
            .into());
        }

        self.odb.exists_batch(values, default_jobs())
    }
}
