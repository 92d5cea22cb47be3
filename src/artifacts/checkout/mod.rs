//! Checkout engine
//!
//! Reconciles a workspace tree with a desired index:
//!
//! 1. Diff the observed index against the desired one
//! 2. Refuse to discard content that exists in no cache or remote,
//!    unless forced — checkout is never a silent data-loss operation
//! 3. Apply deletions, then materialize additions and modifications
//!    through the cheapest negotiated link strategy, fanned out over the
//!    worker pool
//!
//! A failure on one entry never aborts the rest: failures are collected
//! per tracked output and reported in an aggregate error that still
//! carries everything that succeeded.

pub mod link;

use crate::areas::odb::Odb;
use crate::areas::remote::Remote;
use crate::areas::workspace::Workspace;
use crate::artifacts::checkout::link::{LinkNegotiator, LinkType};
use crate::artifacts::core::{default_jobs, run_jobs};
use crate::artifacts::diff::{Change, ChangeType, DiffOptions, diff};
use crate::artifacts::index::Index;
use crate::artifacts::index::index_entry::{IndexEntry, key_to_path, key_to_string};
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct CheckoutOptions {
    /// Proceed even when discarded content is unrecoverable.
    pub force: bool,
    /// Re-materialize unchanged entries too (link-type switch).
    pub relink: bool,
    pub jobs: usize,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        CheckoutOptions {
            force: false,
            relink: false,
            jobs: default_jobs(),
        }
    }
}

/// Structured checkout summary, JSON-serializable for scripting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckoutStats {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    /// Tracked outputs with at least one failed entry.
    pub failed: Vec<String>,
    /// Paths whose current content could not be found in any cache or
    /// remote; blocked the operation unless forced.
    pub unrecoverable: Vec<String>,
}

impl CheckoutStats {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.failed.is_empty()
            && self.unrecoverable.is_empty()
    }
}

/// Checkout failure that still carries the partial stats, so callers can
/// report progress even when the operation did not fully succeed.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CheckoutError {
    pub message: String,
    pub stats: CheckoutStats,
}

pub struct CheckoutEngine<'a> {
    workspace: &'a Workspace,
    odb: &'a Odb,
    remote: Option<&'a dyn Remote>,
}

impl<'a> CheckoutEngine<'a> {
    pub fn new(workspace: &'a Workspace, odb: &'a Odb, remote: Option<&'a dyn Remote>) -> Self {
        CheckoutEngine {
            workspace,
            odb,
            remote,
        }
    }

    /// Reconcile `old` (observed workspace state) with `new` (desired).
    pub fn checkout(
        &self,
        old: &Index,
        new: &Index,
        opts: &CheckoutOptions,
    ) -> anyhow::Result<CheckoutStats> {
        let changes = diff(
            old,
            new,
            DiffOptions {
                with_unchanged: opts.relink,
                ..Default::default()
            },
        );

        let blocked = self.unrecoverable_paths(&changes, opts.jobs)?;
        if !blocked.is_empty() {
            if !opts.force {
                let message = format!(
                    "Refusing to discard {} path(s) whose content exists in no cache or remote \
                     (use force to override): {}",
                    blocked.len(),
                    blocked.join(", ")
                );
                let stats = CheckoutStats {
                    unrecoverable: blocked,
                    ..Default::default()
                };
                return Err(CheckoutError { message, stats }.into());
            }
            warn!(paths = ?blocked, "discarding unrecoverable workspace content (forced)");
        }

        let mut stats = CheckoutStats::default();
        let mut failed_roots = BTreeSet::new();
        let negotiator = LinkNegotiator::default();

        // deletions first, in key order: a directory goes before its members
        for change in &changes {
            if change.kind != ChangeType::Deleted {
                continue;
            }
            match self.workspace.remove(&key_to_path(&change.key)) {
                Ok(()) => stats.deleted.push(key_to_string(&change.key)),
                Err(err) => Self::record_failure(new, change, &err, &mut failed_roots),
            }
        }

        let to_apply: Vec<(&Change, &IndexEntry)> = changes
            .iter()
            .filter_map(|change| {
                let materialize = match change.kind {
                    ChangeType::Added | ChangeType::Modified => true,
                    ChangeType::Unchanged => opts.relink,
                    _ => false,
                };
                change
                    .new
                    .as_ref()
                    .filter(|_| materialize)
                    .map(|entry| (change, entry))
            })
            .collect();

        // entries materialize independently (parent directories are created
        // on demand), so they fan out over the worker pool
        let outcomes = run_jobs(to_apply, opts.jobs, |(change, entry)| {
            (change, self.apply_entry(entry, change.kind, &negotiator))
        });

        for (change, result) in outcomes {
            match result {
                Ok(()) => match change.kind {
                    ChangeType::Added => stats.added.push(key_to_string(&change.key)),
                    // relinked entries count as modified in the summary
                    _ => stats.modified.push(key_to_string(&change.key)),
                },
                Err(err) => Self::record_failure(new, change, &err, &mut failed_roots),
            }
        }

        // workers finish in no particular order; the summary stays sorted
        stats.added.sort();
        stats.modified.sort();

        stats.failed = failed_roots.into_iter().collect();

        if !stats.failed.is_empty() {
            let message = format!(
                "Checkout failed for {} output(s): {}",
                stats.failed.len(),
                stats.failed.join(", ")
            );
            return Err(CheckoutError { message, stats }.into());
        }

        Ok(stats)
    }

    /// Paths among the pending deletions/modifications whose current
    /// content is recoverable from neither the local cache nor the remote.
    ///
    /// A remote transport error propagates as an error: "could not check"
    /// must never degrade into "not there".
    fn unrecoverable_paths(
        &self,
        changes: &[Change],
        jobs: usize,
    ) -> anyhow::Result<Vec<String>> {
        let mut by_hash: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut blocked = Vec::new();

        for change in changes {
            if !matches!(change.kind, ChangeType::Deleted | ChangeType::Modified) {
                continue;
            }
            let Some(old) = &change.old else { continue };
            match &old.hash {
                // content that was never hashed cannot be verified anywhere
                None => blocked.push(key_to_string(&change.key)),
                Some(hash) => by_hash
                    .entry(hash.file_value().to_string())
                    .or_default()
                    .push(key_to_string(&change.key)),
            }
        }

        if by_hash.is_empty() {
            return Ok(blocked);
        }

        let values: Vec<String> = by_hash.keys().cloned().collect();
        let in_cache = self.odb.exists_batch(&values, jobs)?;
        let missing: Vec<String> = values
            .into_iter()
            .filter(|value| !in_cache.contains(value))
            .collect();

        let in_remote: HashSet<String> = match (&self.remote, missing.is_empty()) {
            (Some(remote), false) => remote
                .exists_batch(&missing)
                .context("Unable to verify workspace content against the remote")?,
            _ => HashSet::new(),
        };

        for value in missing {
            if !in_remote.contains(&value) {
                blocked.extend(by_hash.remove(&value).unwrap_or_default());
            }
        }

        blocked.sort();
        blocked.dedup();
        Ok(blocked)
    }

    fn apply_entry(
        &self,
        entry: &IndexEntry,
        kind: ChangeType,
        negotiator: &LinkNegotiator,
    ) -> anyhow::Result<()> {
        let rel = entry.rel_path();

        if entry.is_dir() {
            // aggregate entry: ensure the directory exists; its members are
            // separate changes and materialize on their own
            return self.workspace.make_dir(&rel);
        }

        let hash = entry
            .hash
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Entry {} has no hash to materialize", rel.display()))?;

        if !self.odb.contains_entry(entry)? {
            anyhow::bail!("Object {} is not in the cache", hash);
        }

        // drop the current copy before re-linking (modified or relink)
        if kind != ChangeType::Added {
            self.workspace.remove(&rel)?;
        }
        self.workspace.make_parent_dirs(&rel)?;

        let src = self.odb.path_for(hash.file_value());
        let dst = self.workspace.abs(&rel);
        let used = negotiator.link(&src, &dst)?;

        // only private copies may diverge from the cache permissions
        if entry.meta.is_exec && matches!(used, LinkType::Copy | LinkType::Reflink) {
            set_executable(&dst)?;
        }

        Ok(())
    }

    fn record_failure(
        new: &Index,
        change: &Change,
        err: &anyhow::Error,
        failed_roots: &mut BTreeSet<String>,
    ) {
        let root = new.root_of(&change.key);
        warn!(
            path = %key_to_string(&change.key),
            error = %err,
            "checkout entry failed"
        );
        failed_roots.insert(key_to_string(&root));
    }
}

#[cfg(unix)]
fn set_executable(path: &std::path::Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Unable to stat {}", path.display()))?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("Unable to set permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &std::path::Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::areas::state::StateCache;
    use crate::artifacts::hash::hash_bytes;
    use crate::artifacts::index::index_entry::{Key, Meta, key_from_path};
    use pretty_assertions::assert_eq;
    use std::path::{Path, PathBuf};

    struct Fixture {
        _dir: tempfile::TempDir,
        workspace: Workspace,
        odb: Odb,
        state: StateCache,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let workspace = Workspace::new(dir.path().join("ws").into_boxed_path());
        std::fs::create_dir_all(workspace.path()).unwrap();
        let odb = Odb::new(dir.path().join("cache").into_boxed_path());
        let state =
            StateCache::load(dir.path().join("state.json").into_boxed_path()).unwrap();
        Fixture {
            _dir: dir,
            workspace,
            odb,
            state,
        }
    }

    fn key(parts: &[&str]) -> Key {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn tracked_file(fixture: &Fixture, rel: &str, content: &[u8]) -> IndexEntry {
        let hash = hash_bytes(content);
        fixture.odb.add_bytes(content, &hash).unwrap();
        IndexEntry::new(
            key_from_path(Path::new(rel)),
            Meta {
                size: content.len() as u64,
                ..Default::default()
            },
            Some(hash),
        )
    }

    #[test]
    fn materializes_missing_files() {
        let mut fixture = fixture();
        let desired = Index::from_entries([tracked_file(&fixture, "data.txt", b"hello")]);
        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);

        let old = fixture
            .workspace
            .build_index(&[PathBuf::from("data.txt")], &mut fixture.state, 1)
            .unwrap();
        let stats = engine
            .checkout(&old, &desired, &CheckoutOptions::default())
            .unwrap();

        assert_eq!(stats.added, vec!["data.txt".to_string()]);
        assert_eq!(
            std::fs::read(fixture.workspace.abs(Path::new("data.txt"))).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn materializes_many_entries_across_workers() {
        let mut fixture = fixture();
        let rels: Vec<String> = (0..8).map(|i| format!("part-{}.bin", i)).collect();
        let entries: Vec<IndexEntry> = rels
            .iter()
            .map(|rel| tracked_file(&fixture, rel, rel.as_bytes()))
            .collect();
        let desired = Index::from_entries(entries);
        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);

        let roots: Vec<PathBuf> = rels.iter().map(PathBuf::from).collect();
        let old = fixture
            .workspace
            .build_index(&roots, &mut fixture.state, 4)
            .unwrap();
        let stats = engine
            .checkout(
                &old,
                &desired,
                &CheckoutOptions {
                    jobs: 4,
                    ..Default::default()
                },
            )
            .unwrap();

        // every file landed, and the summary is sorted regardless of
        // which worker finished first
        assert_eq!(stats.added, rels);
        for rel in &rels {
            assert_eq!(
                std::fs::read(fixture.workspace.abs(Path::new(rel))).unwrap(),
                rel.as_bytes()
            );
        }
    }

    #[test]
    fn second_checkout_is_a_noop() {
        let mut fixture = fixture();
        let desired = Index::from_entries([tracked_file(&fixture, "data.txt", b"hello")]);
        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);

        let old = fixture
            .workspace
            .build_index(&[PathBuf::from("data.txt")], &mut fixture.state, 1)
            .unwrap();
        engine
            .checkout(&old, &desired, &CheckoutOptions::default())
            .unwrap();

        let old = fixture
            .workspace
            .build_index(&[PathBuf::from("data.txt")], &mut fixture.state, 1)
            .unwrap();
        let stats = engine
            .checkout(&old, &desired, &CheckoutOptions::default())
            .unwrap();

        assert!(stats.is_noop());
    }

    #[test]
    fn refuses_to_discard_unrecoverable_content() {
        let mut fixture = fixture();
        // desired state: tracked file with cached content
        let desired = Index::from_entries([tracked_file(&fixture, "data.txt", b"cached")]);
        // workspace holds different content that was never saved anywhere
        std::fs::write(fixture.workspace.abs(Path::new("data.txt")), b"precious").unwrap();

        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);
        let old = fixture
            .workspace
            .build_index(&[PathBuf::from("data.txt")], &mut fixture.state, 1)
            .unwrap();

        let err = engine
            .checkout(&old, &desired, &CheckoutOptions::default())
            .unwrap_err();
        let checkout_err = err.downcast_ref::<CheckoutError>().unwrap();

        assert_eq!(checkout_err.stats.unrecoverable, vec!["data.txt".to_string()]);
        // the file was left untouched
        assert_eq!(
            std::fs::read(fixture.workspace.abs(Path::new("data.txt"))).unwrap(),
            b"precious"
        );
    }

    #[test]
    fn force_discards_and_proceeds() {
        let mut fixture = fixture();
        let desired = Index::from_entries([tracked_file(&fixture, "data.txt", b"cached")]);
        std::fs::write(fixture.workspace.abs(Path::new("data.txt")), b"precious").unwrap();

        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);
        let old = fixture
            .workspace
            .build_index(&[PathBuf::from("data.txt")], &mut fixture.state, 1)
            .unwrap();

        let stats = engine
            .checkout(
                &old,
                &desired,
                &CheckoutOptions {
                    force: true,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(stats.modified, vec!["data.txt".to_string()]);
        assert_eq!(
            std::fs::read(fixture.workspace.abs(Path::new("data.txt"))).unwrap(),
            b"cached"
        );
    }

    #[test]
    fn failure_on_one_output_does_not_abort_the_rest() {
        let mut fixture = fixture();
        let good = tracked_file(&fixture, "good.txt", b"good");
        // entry whose object is deliberately not in the cache
        let missing = IndexEntry::new(
            key(&["broken.txt"]),
            Meta::default(),
            Some(hash_bytes(b"never stored")),
        );
        let desired = Index::from_entries([good, missing]);

        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);
        let old = fixture
            .workspace
            .build_index(
                &[PathBuf::from("good.txt"), PathBuf::from("broken.txt")],
                &mut fixture.state,
                1,
            )
            .unwrap();

        let err = engine
            .checkout(&old, &desired, &CheckoutOptions::default())
            .unwrap_err();
        let checkout_err = err.downcast_ref::<CheckoutError>().unwrap();

        assert_eq!(checkout_err.stats.failed, vec!["broken.txt".to_string()]);
        assert_eq!(checkout_err.stats.added, vec!["good.txt".to_string()]);
        assert_eq!(
            std::fs::read(fixture.workspace.abs(Path::new("good.txt"))).unwrap(),
            b"good"
        );
    }

    #[test]
    fn deletes_entries_absent_from_desired_state() {
        let mut fixture = fixture();
        // current content is cached, so deletion is safe
        let entry = tracked_file(&fixture, "old.txt", b"old content");
        std::fs::write(fixture.workspace.abs(Path::new("old.txt")), b"old content").unwrap();
        let _ = entry;

        let engine = CheckoutEngine::new(&fixture.workspace, &fixture.odb, None);
        let old = fixture
            .workspace
            .build_index(&[PathBuf::from("old.txt")], &mut fixture.state, 1)
            .unwrap();

        let stats = engine
            .checkout(&old, &Index::new(), &CheckoutOptions::default())
            .unwrap();

        assert_eq!(stats.deleted, vec!["old.txt".to_string()]);
        assert!(!fixture.workspace.abs(Path::new("old.txt")).exists());
    }
}
