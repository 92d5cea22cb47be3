//! Repository wiring
//!
//! A repository is a workspace directory with a `.stash/` control
//! directory next to the tracked files:
//!
//! ```text
//! .stash/
//! ├── cache/          content-addressed object database
//! ├── snapshots/      named index snapshots
//! ├── config.json     optional remote store location
//! ├── index.json      tracked entries
//! ├── state.json      (mtime, size) -> digest cache
//! └── rwlock          multi-process read/write lock
//! ```
//!
//! Every mutating operation runs under the rwlock scoped to the paths it
//! touches, so two processes can add disjoint outputs concurrently but
//! never race on the same one.

use crate::areas::odb::Odb;
use crate::areas::remote::FsRemote;
use crate::areas::state::StateCache;
use crate::areas::workspace::Workspace;
use crate::artifacts::checkout::{CheckoutEngine, CheckoutOptions, CheckoutStats};
use crate::artifacts::diff::{Change, DiffOptions, diff};
use crate::artifacts::gc::{
    Brancher, GcConfigError, GcOptions, GcReport, GcScope, Revision, collect_used, run as run_gc,
};
use crate::artifacts::index::Index;
use crate::artifacts::index::index_entry::{
    IndexEntry, Key, key_from_path, key_to_path, key_to_string,
};
use crate::artifacts::lock::{GuardKind, RwLock};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

pub const STASH_DIR: &str = ".stash";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Root of a filesystem remote store (network mount or shared cache).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<PathBuf>,
    /// Use the hardlink guard for lock-file edits, for filesystems where
    /// advisory locks do not work (e.g. some NFS mounts).
    #[serde(default)]
    pub hardlink_lock: bool,
}

/// One persisted snapshot of the tracked index.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    created_at: DateTime<Utc>,
    entries: Vec<IndexEntry>,
}

#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    workspace: Workspace,
    odb: Odb,
    lock: RwLock,
    config: Config,
}

impl Repository {
    /// Create the control directory and an empty index inside `root`.
    pub fn init(root: &Path, remote: Option<PathBuf>) -> anyhow::Result<Self> {
        let stash_dir = root.join(STASH_DIR);
        if stash_dir.exists() {
            anyhow::bail!("Already a repository: {}", stash_dir.display());
        }

        std::fs::create_dir_all(stash_dir.join("cache"))
            .with_context(|| format!("Unable to create {}", stash_dir.display()))?;
        std::fs::create_dir_all(stash_dir.join("snapshots"))?;

        let config = Config {
            remote,
            ..Default::default()
        };
        let data = serde_json::to_vec_pretty(&config).context("Unable to serialize config")?;
        std::fs::write(stash_dir.join("config.json"), data)
            .context("Unable to write config.json")?;

        info!(root = %root.display(), "initialized repository");
        Self::open(root)
    }

    /// Open the repository containing `path`, searching ancestor
    /// directories for the control directory.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let start = path
            .canonicalize()
            .with_context(|| format!("No such directory: {}", path.display()))?;

        let root = start
            .ancestors()
            .find(|dir| dir.join(STASH_DIR).is_dir())
            .with_context(|| {
                format!(
                    "Not a repository (no {} in {} or any parent)",
                    STASH_DIR,
                    start.display()
                )
            })?
            .to_path_buf();

        let stash_dir = root.join(STASH_DIR);
        let config: Config = match std::fs::read(stash_dir.join("config.json")) {
            Ok(data) => serde_json::from_slice(&data).context("Corrupt config.json")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(err) => return Err(err).context("Unable to read config.json"),
        };

        let guard_kind = if config.hardlink_lock {
            GuardKind::Hardlink
        } else {
            GuardKind::Flock
        };

        Ok(Repository {
            workspace: Workspace::new(root.clone().into_boxed_path()),
            odb: Odb::new(stash_dir.join("cache").into_boxed_path()),
            lock: RwLock::new(stash_dir.join("rwlock").into_boxed_path(), guard_kind),
            config,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn odb(&self) -> &Odb {
        &self.odb
    }

    fn stash_dir(&self) -> PathBuf {
        self.root.join(STASH_DIR)
    }

    fn index_path(&self) -> PathBuf {
        self.stash_dir().join("index.json")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.stash_dir().join("snapshots")
    }

    fn load_state(&self) -> anyhow::Result<StateCache> {
        StateCache::load(self.stash_dir().join("state.json").into_boxed_path())
    }

    /// The persisted tracked index; missing file means nothing is tracked.
    pub fn load_index(&self) -> anyhow::Result<Index> {
        let entries: Vec<IndexEntry> = match std::fs::read(self.index_path()) {
            Ok(data) => serde_json::from_slice(&data).context("Corrupt index.json")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context("Unable to read index.json"),
        };
        Ok(Index::from_entries(entries))
    }

    fn save_index(&self, index: &Index) -> anyhow::Result<()> {
        let entries: Vec<&IndexEntry> = index.entries().collect();
        let data = serde_json::to_vec(&entries).context("Unable to serialize index")?;
        std::fs::write(self.index_path(), data).context("Unable to write index.json")
    }

    /// Resolve CLI path arguments to workspace-relative roots.
    fn rel_targets(&self, paths: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
        paths
            .iter()
            .map(|path| {
                let abs = if path.is_absolute() {
                    path.clone()
                } else {
                    std::env::current_dir()?.join(path)
                };
                // normalize without requiring the path to exist
                let mut normalized = PathBuf::new();
                for component in abs.components() {
                    match component {
                        std::path::Component::ParentDir => {
                            normalized.pop();
                        }
                        std::path::Component::CurDir => {}
                        other => normalized.push(other),
                    }
                }
                normalized
                    .strip_prefix(&self.root)
                    .map(Path::to_path_buf)
                    .map_err(|_| {
                        anyhow::anyhow!("{} is outside the repository", path.display())
                    })
            })
            .collect()
    }

    /// Track the given paths: hash them, store their content in the cache
    /// and record them in the index. Returns the tracked root keys.
    pub fn add(&self, paths: &[PathBuf], jobs: usize) -> anyhow::Result<Vec<String>> {
        let targets = self.rel_targets(paths)?;

        // a path inside an already-tracked directory widens to its tracked
        // root, so the parent's aggregate digest is rebuilt rather than
        // left stale
        let tracked = self.load_index()?;
        let root_keys: BTreeSet<Key> = targets
            .iter()
            .map(|target| tracked.root_of(&key_from_path(target)))
            .collect();
        let roots: Vec<PathBuf> = root_keys.iter().map(|key| key_to_path(key)).collect();

        let _guard = self.lock.acquire(&[], &roots)?;

        let mut state = self.load_state()?;
        let observed = self.workspace.build_index(&roots, &mut state, jobs)?;
        if observed.is_empty() {
            anyhow::bail!("Nothing to add: none of the given paths exist");
        }

        for entry in observed.entries() {
            let Some(hash) = &entry.hash else { continue };
            if entry.is_dir() {
                self.odb.store_tree(&observed.tree_of(&entry.key)?)?;
            } else {
                self.odb.add_file(&self.workspace.abs(&entry.rel_path()), hash)?;
            }
        }

        // each root replaces its whole subtree: entries deleted from the
        // workspace must not survive the merge
        let mut index = self.load_index()?;
        let added = observed.root_keys();
        for root in &added {
            index.remove(root);
        }
        for entry in observed.into_entries() {
            index.add(entry);
        }

        self.save_index(&index)?;
        state.save()?;

        Ok(added.iter().map(key_to_string).collect())
    }

    /// Diff the live workspace against the tracked index. Read-only.
    pub fn status(&self, jobs: usize) -> anyhow::Result<Vec<Change>> {
        let desired = self.load_index()?;
        let roots: Vec<PathBuf> = desired.root_keys().iter().map(key_to_path).collect();
        let _guard = self.lock.acquire(&roots, &[])?;

        let mut state = self.load_state()?;
        let observed = self.workspace.build_index(&roots, &mut state, jobs)?;
        state.save()?;

        // tracked state as the baseline, so a missing workspace copy reads
        // as deleted rather than pending-add
        Ok(diff(
            &desired,
            &observed,
            DiffOptions {
                shallow: true,
                ..Default::default()
            },
        ))
    }

    /// Restore the workspace to the tracked index.
    pub fn checkout(&self, opts: &CheckoutOptions) -> anyhow::Result<CheckoutStats> {
        let desired = self.load_index()?;
        let roots: Vec<PathBuf> = desired.root_keys().iter().map(key_to_path).collect();
        let _guard = self.lock.acquire(&[], &roots)?;

        let mut state = self.load_state()?;
        let observed = self.workspace.build_index(&roots, &mut state, opts.jobs)?;
        state.save()?;

        let remote = self.config.remote.as_deref().map(FsRemote::new);
        let engine = CheckoutEngine::new(
            &self.workspace,
            &self.odb,
            remote.as_ref().map(|r| r as &dyn crate::areas::remote::Remote),
        );

        engine.checkout(&observed, &desired, opts)
    }

    /// Persist the current tracked index under a name.
    pub fn snapshot(&self, name: &str) -> anyhow::Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            anyhow::bail!("Invalid snapshot name '{}'", name);
        }

        let snapshot_path = self.snapshots_dir().join(format!("{}.json", name));
        if snapshot_path.exists() {
            anyhow::bail!("Snapshot '{}' already exists", name);
        }

        let index = self.load_index()?;
        let file = SnapshotFile {
            created_at: Utc::now(),
            entries: index.entries().cloned().collect(),
        };
        std::fs::create_dir_all(self.snapshots_dir())?;
        let data = serde_json::to_vec(&file).context("Unable to serialize snapshot")?;
        std::fs::write(&snapshot_path, data)
            .with_context(|| format!("Unable to write snapshot '{}'", name))?;

        info!(snapshot = name, "created snapshot");
        Ok(())
    }

    fn load_snapshot(&self, name: &str) -> anyhow::Result<SnapshotFile> {
        let data = std::fs::read(self.snapshots_dir().join(format!("{}.json", name)))
            .with_context(|| format!("No such snapshot '{}'", name))?;
        serde_json::from_slice(&data).with_context(|| format!("Corrupt snapshot '{}'", name))
    }

    fn snapshot_names(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.snapshots_dir();
        if !dir.is_dir() {
            return Ok(names);
        }

        for entry in std::fs::read_dir(&dir)? {
            let file_name = entry?.file_name().to_string_lossy().into_owned();
            if let Some(name) = file_name.strip_suffix(".json") {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Remove every cached object not referenced by the requested scope.
    ///
    /// Takes a whole-repository write lock: nothing may mutate the index or
    /// cache while unreferenced objects are being deleted.
    pub fn gc(&self, opts: &GcOptions, cloud: bool) -> anyhow::Result<GcReport> {
        // configuration errors must fire before any lock or cache I/O
        if !opts.has_scope() {
            return Err(GcConfigError.into());
        }

        let _guard = self.lock.acquire(&[], &[PathBuf::new()])?;

        let brancher = SnapshotBrancher { repo: self };
        let used = collect_used(&brancher, &self.odb, opts)?;

        let remote_odb = if cloud {
            let root = self
                .config
                .remote
                .as_ref()
                .context("No remote configured, cannot collect cloud storage")?;
            Some(Odb::new(root.clone().into_boxed_path()))
        } else {
            None
        };

        run_gc(&self.odb, remote_odb.as_ref(), &used)
    }
}

/// Revision iteration over the live workspace and named snapshots.
struct SnapshotBrancher<'r> {
    repo: &'r Repository,
}

impl Brancher for SnapshotBrancher<'_> {
    fn revisions(&self, opts: &GcOptions) -> anyhow::Result<Vec<Revision>> {
        let mut revisions = Vec::new();

        if opts.scope.contains(GcScope::WORKSPACE) {
            revisions.push(Revision::Workspace);
        }

        let mut names: Vec<String> = if opts.scope.contains(GcScope::ALL_SNAPSHOTS) {
            self.repo.snapshot_names()?
        } else {
            Vec::new()
        };
        names.extend(opts.revs.iter().cloned());

        if let Some(after) = opts.after {
            for name in self.repo.snapshot_names()? {
                if names.contains(&name) {
                    continue;
                }
                if self.repo.load_snapshot(&name)?.created_at >= after {
                    names.push(name);
                }
            }
        }

        names.sort();
        names.dedup();
        revisions.extend(names.into_iter().map(Revision::Snapshot));

        Ok(revisions)
    }

    fn index_at(&self, rev: &Revision) -> anyhow::Result<Index> {
        match rev {
            Revision::Workspace => self.repo.load_index(),
            Revision::Snapshot(name) => Ok(Index::from_entries(
                self.repo.load_snapshot(name)?.entries,
            )),
        }
    }
}
