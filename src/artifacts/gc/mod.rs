//! Garbage collection
//!
//! Walks every in-scope revision, collects the digest of each tracked
//! output (expanding directory aggregates into their members through the
//! stored tree object), and deletes everything else from the object
//! database. GC is inherently destructive, so two rules are enforced
//! strictly:
//!
//! - an empty scope is a configuration error, never "collect nothing and
//!   delete the whole cache"
//! - a revision whose collection fails aborts the pass unless the caller
//!   explicitly opted into `skip_failed`

use crate::areas::odb::Odb;
use crate::artifacts::core::default_jobs;
use crate::artifacts::index::Index;
use anyhow::Context;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct GcScope: u32 {
        /// The live workspace's tracked outputs.
        const WORKSPACE = 0b0001;
        /// Every named snapshot.
        const ALL_SNAPSHOTS = 0b0010;
    }
}

#[derive(Debug, Clone)]
pub struct GcOptions {
    pub scope: GcScope,
    /// Additional named revisions to keep.
    pub revs: Vec<String>,
    /// Keep snapshots created at or after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Log and continue when one revision fails to load instead of
    /// aborting the whole pass.
    pub skip_failed: bool,
    pub jobs: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        GcOptions {
            scope: GcScope::empty(),
            revs: Vec::new(),
            after: None,
            skip_failed: false,
            jobs: default_jobs(),
        }
    }
}

impl GcOptions {
    pub fn has_scope(&self) -> bool {
        !self.scope.is_empty() || !self.revs.is_empty() || self.after.is_some()
    }
}

/// Raised before any I/O when GC is invoked with no scope at all.
#[derive(Debug, Error)]
#[error(
    "no garbage collection scope given: pass at least one of workspace, \
     all snapshots, a revision, or a date"
)]
pub struct GcConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// Sentinel for the live workspace.
    Workspace,
    Snapshot(String),
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Revision::Workspace => write!(f, "workspace"),
            Revision::Snapshot(name) => write!(f, "{}", name),
        }
    }
}

/// Revision-iteration collaborator: yields the identifiers selected by the
/// scope and loads the tracked index recorded at each one. The core never
/// walks revision history itself.
pub trait Brancher {
    fn revisions(&self, opts: &GcOptions) -> anyhow::Result<Vec<Revision>>;
    fn index_at(&self, rev: &Revision) -> anyhow::Result<Index>;
}

/// Digests still referenced by at least one in-scope revision.
#[derive(Debug, Default)]
pub struct UsedObjects {
    hashes: HashSet<String>,
}

impl UsedObjects {
    pub fn hashes(&self) -> &HashSet<String> {
        &self.hashes
    }

    pub fn contains(&self, value: &str) -> bool {
        self.hashes.contains(value)
    }

    /// Record every digest reachable from one revision's index, expanding
    /// directory aggregates through their tree objects.
    fn extend_from_index(&mut self, index: &Index, odb: &Odb) -> anyhow::Result<()> {
        for entry in index.entries() {
            let Some(hash) = &entry.hash else { continue };
            self.hashes.insert(hash.file_value().to_string());

            if hash.is_dir() && entry.is_dir() {
                let tree = odb
                    .load_tree(hash)
                    .with_context(|| format!("Unable to expand directory object {}", hash))?;
                for tree_entry in tree.entries() {
                    self.hashes.insert(tree_entry.hash.clone());
                }
            }
        }
        Ok(())
    }
}

/// Per-store removal counts. `None` means the store does not exist, which
/// is reported distinctly from a store that had nothing to remove.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct GcReport {
    pub removed_local: usize,
    pub removed_remote: Option<usize>,
}

/// Accumulate the used-object set across every in-scope revision.
///
/// The returned set is complete for the requested scope: if any revision
/// fails to load and `skip_failed` is not set, the error aborts collection
/// so deletion never runs against a partially-collected set.
pub fn collect_used(
    brancher: &dyn Brancher,
    odb: &Odb,
    opts: &GcOptions,
) -> anyhow::Result<UsedObjects> {
    if !opts.has_scope() {
        return Err(GcConfigError.into());
    }

    let mut used = UsedObjects::default();

    for rev in brancher.revisions(opts)? {
        let collected = brancher
            .index_at(&rev)
            .and_then(|index| used.extend_from_index(&index, odb));

        match collected {
            Ok(()) => {}
            Err(err) if opts.skip_failed => {
                warn!(revision = %rev, error = %err, "skipping failed revision");
            }
            Err(err) => {
                return Err(err.context(format!(
                    "Unable to collect used objects at revision '{}' \
                     (pass skip_failed to ignore)",
                    rev
                )));
            }
        }
    }

    Ok(used)
}

/// Delete everything outside the used set from the local store and, when
/// requested, from the remote store.
pub fn run(odb: &Odb, remote_odb: Option<&Odb>, used: &UsedObjects) -> anyhow::Result<GcReport> {
    let removed_local = odb.gc(used.hashes())?;
    info!(removed = removed_local, "collected local object store");

    let removed_remote = match remote_odb {
        Some(remote) if remote.root().is_dir() => {
            let removed = remote.gc(used.hashes())?;
            info!(removed, "collected remote object store");
            Some(removed)
        }
        Some(remote) => {
            warn!(root = %remote.root().display(), "remote store does not exist, nothing to collect");
            None
        }
        None => None,
    };

    Ok(GcReport {
        removed_local,
        removed_remote,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::hash::hash_bytes;
    use crate::artifacts::index::index_entry::{IndexEntry, Meta};
    use pretty_assertions::assert_eq;

    struct FixedBrancher {
        revisions: Vec<(Revision, anyhow::Result<Index>)>,
    }

    impl Brancher for FixedBrancher {
        fn revisions(&self, _opts: &GcOptions) -> anyhow::Result<Vec<Revision>> {
            Ok(self.revisions.iter().map(|(rev, _)| rev.clone()).collect())
        }

        fn index_at(&self, rev: &Revision) -> anyhow::Result<Index> {
            for (known, result) in &self.revisions {
                if known == rev {
                    return match result {
                        Ok(index) => Ok(index.clone()),
                        Err(err) => Err(anyhow::anyhow!("{}", err)),
                    };
                }
            }
            anyhow::bail!("unknown revision {}", rev)
        }
    }

    fn file_entry(name: &str, content: &[u8]) -> IndexEntry {
        IndexEntry::new(
            vec![name.to_string()],
            Meta::default(),
            Some(hash_bytes(content)),
        )
    }

    fn workspace_scope() -> GcOptions {
        GcOptions {
            scope: GcScope::WORKSPACE,
            ..Default::default()
        }
    }

    #[test]
    fn empty_scope_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::new(dir.path().to_path_buf().into_boxed_path());
        let brancher = FixedBrancher {
            revisions: Vec::new(),
        };

        let err = collect_used(&brancher, &odb, &GcOptions::default()).unwrap_err();

        assert!(err.is::<GcConfigError>());
    }

    #[test]
    fn keeps_referenced_and_removes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::new(dir.path().to_path_buf().into_boxed_path());
        let h1 = hash_bytes(b"one");
        let h2 = hash_bytes(b"two");
        let h3 = hash_bytes(b"orphan");
        odb.add_bytes(b"one", &h1).unwrap();
        odb.add_bytes(b"two", &h2).unwrap();
        odb.add_bytes(b"orphan", &h3).unwrap();

        let brancher = FixedBrancher {
            revisions: vec![(
                Revision::Workspace,
                Ok(Index::from_entries([
                    file_entry("a", b"one"),
                    file_entry("b", b"two"),
                ])),
            )],
        };

        let used = collect_used(&brancher, &odb, &workspace_scope()).unwrap();
        let report = run(&odb, None, &used).unwrap();

        assert_eq!(report.removed_local, 1);
        assert!(odb.exists(h1.file_value()).unwrap());
        assert!(odb.exists(h2.file_value()).unwrap());
        assert!(!odb.exists(h3.file_value()).unwrap());
    }

    #[test]
    fn failed_revision_aborts_without_skip_failed() {
        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::new(dir.path().to_path_buf().into_boxed_path());
        let brancher = FixedBrancher {
            revisions: vec![
                (Revision::Workspace, Ok(Index::new())),
                (
                    Revision::Snapshot("broken".to_string()),
                    Err(anyhow::anyhow!("corrupt snapshot")),
                ),
            ],
        };

        assert!(collect_used(&brancher, &odb, &workspace_scope()).is_err());
    }

    #[test]
    fn failed_revision_is_skipped_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::new(dir.path().to_path_buf().into_boxed_path());
        let h1 = hash_bytes(b"kept");
        odb.add_bytes(b"kept", &h1).unwrap();

        let brancher = FixedBrancher {
            revisions: vec![
                (
                    Revision::Workspace,
                    Ok(Index::from_entries([file_entry("a", b"kept")])),
                ),
                (
                    Revision::Snapshot("broken".to_string()),
                    Err(anyhow::anyhow!("corrupt snapshot")),
                ),
            ],
        };
        let opts = GcOptions {
            skip_failed: true,
            ..workspace_scope()
        };

        let used = collect_used(&brancher, &odb, &opts).unwrap();

        assert!(used.contains(h1.file_value()));
    }

    #[test]
    fn directory_aggregates_expand_to_members() {
        use crate::artifacts::hash::tree::{Tree, TreeEntry};

        let dir = tempfile::tempdir().unwrap();
        let odb = Odb::new(dir.path().to_path_buf().into_boxed_path());
        let child = hash_bytes(b"member");
        odb.add_bytes(b"member", &child).unwrap();
        let tree = Tree::from_entries(vec![TreeEntry {
            relpath: "m.txt".to_string(),
            hash: child.file_value().to_string(),
            size: 6,
            is_executable: false,
        }]);
        let dir_hash = odb.store_tree(&tree).unwrap();

        let dir_entry = IndexEntry::new(
            vec!["data".to_string()],
            Meta {
                is_dir: true,
                ..Default::default()
            },
            Some(dir_hash.clone()),
        );
        let brancher = FixedBrancher {
            revisions: vec![(Revision::Workspace, Ok(Index::from_entries([dir_entry])))],
        };

        let used = collect_used(&brancher, &odb, &workspace_scope()).unwrap();

        assert!(used.contains(dir_hash.file_value()));
        assert!(used.contains(child.file_value()));
    }
}
