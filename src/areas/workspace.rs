//! Workspace (the user's live directory tree)
//!
//! Builds the "old" index for diffing by walking tracked roots and hashing
//! lazily: a file whose mtime and size still match the state cache is not
//! re-read. Directory roots aggregate their children into a tree object
//! digest so unchanged directories short-circuit at the aggregate level.

use crate::areas::state::StateCache;
use crate::artifacts::core::run_jobs;
use crate::artifacts::hash::hash_file;
use crate::artifacts::hash::hash_info::HashInfo;
use crate::artifacts::hash::tree::{Tree, TreeEntry};
use crate::artifacts::index::Index;
use crate::artifacts::index::index_entry::{IndexEntry, Meta, key_from_path, key_to_string};
use anyhow::Context;
use is_executable::IsExecutable;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const IGNORED_PATHS: [&str; 3] = [".stash", ".", ".."];

#[derive(Debug)]
pub struct Workspace {
    path: Box<Path>,
}

impl Workspace {
    pub fn new(path: Box<Path>) -> Self {
        Workspace { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn abs(&self, rel_path: &Path) -> PathBuf {
        self.path.join(rel_path)
    }

    fn is_ignored(path: &Path) -> bool {
        path.components().any(|component| {
            if let std::path::Component::Normal(name) = component {
                IGNORED_PATHS.contains(&name.to_string_lossy().as_ref())
            } else {
                false
            }
        })
    }

    /// All files under a relative root, as paths relative to the workspace.
    pub fn list_files(&self, rel_root: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let abs_root = self.abs(rel_root);

        Ok(WalkDir::new(&abs_root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(self.path.as_ref()).ok()?;
                if Self::is_ignored(rel) {
                    None
                } else {
                    Some(rel.to_path_buf())
                }
            })
            .collect())
    }

    /// Build the observed-state index for the given tracked roots.
    ///
    /// Missing roots simply produce no entries (they will show up as
    /// `Added` against a desired index). Hash misses are computed on the
    /// worker pool; hits come from the state cache without reading content.
    pub fn build_index(
        &self,
        roots: &[PathBuf],
        state: &mut StateCache,
        jobs: usize,
    ) -> anyhow::Result<Index> {
        let mut index = Index::new();

        for rel_root in roots {
            let abs_root = self.abs(rel_root);
            let metadata = match std::fs::metadata(&abs_root) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Unable to stat {}", abs_root.display()));
                }
            };

            if metadata.is_file() {
                let (hash, size) = self.hash_cached(rel_root, &metadata, state)?;
                index.add(IndexEntry::new(
                    key_from_path(rel_root),
                    Meta {
                        size,
                        is_dir: false,
                        is_exec: abs_root.is_executable(),
                        version_id: None,
                    },
                    Some(hash),
                ));
            } else {
                self.build_dir_entries(rel_root, state, jobs, &mut index)?;
            }
        }

        Ok(index)
    }

    fn build_dir_entries(
        &self,
        rel_root: &Path,
        state: &mut StateCache,
        jobs: usize,
        index: &mut Index,
    ) -> anyhow::Result<()> {
        let root_key = key_from_path(rel_root);
        let mut hashed: Vec<(PathBuf, std::fs::Metadata, HashInfo)> = Vec::new();
        let mut misses: Vec<(PathBuf, std::fs::Metadata)> = Vec::new();

        for rel_file in self.list_files(rel_root)? {
            let metadata = std::fs::metadata(self.abs(&rel_file))
                .with_context(|| format!("Unable to stat {}", rel_file.display()))?;
            match state.get(&key_to_string(&key_from_path(&rel_file)), &metadata) {
                Some(hash) => hashed.push((rel_file, metadata, hash.clone())),
                None => misses.push((rel_file, metadata)),
            }
        }

        if !misses.is_empty() {
            debug!(
                root = %rel_root.display(),
                files = misses.len(),
                "hashing workspace files"
            );
        }

        let computed = run_jobs(misses, jobs, |(rel_file, metadata)| {
            let result = hash_file(&self.abs(&rel_file));
            (rel_file, metadata, result)
        });
        for (rel_file, metadata, result) in computed {
            let (hash, _) = result
                .with_context(|| format!("Unable to hash {}", rel_file.display()))?;
            state.record(
                key_to_string(&key_from_path(&rel_file)),
                &metadata,
                hash.clone(),
            );
            hashed.push((rel_file, metadata, hash));
        }

        let mut tree_entries = Vec::with_capacity(hashed.len());
        let mut children = Vec::with_capacity(hashed.len());

        for (rel_file, metadata, hash) in hashed {
            let key = key_from_path(&rel_file);
            let is_exec = self.abs(&rel_file).is_executable();
            tree_entries.push(TreeEntry {
                relpath: key[root_key.len()..].join("/"),
                hash: hash.file_value().to_string(),
                size: metadata.len(),
                is_executable: is_exec,
            });
            children.push(IndexEntry::new(
                key,
                Meta {
                    size: metadata.len(),
                    is_dir: false,
                    is_exec,
                    version_id: None,
                },
                Some(hash),
            ));
        }

        let tree = Tree::from_entries(tree_entries);
        index.add(IndexEntry::new(
            root_key,
            Meta {
                size: tree.total_size(),
                is_dir: true,
                is_exec: false,
                version_id: None,
            },
            Some(tree.digest()?),
        ));
        for child in children {
            index.add(child);
        }

        Ok(())
    }

    fn hash_cached(
        &self,
        rel_path: &Path,
        metadata: &std::fs::Metadata,
        state: &mut StateCache,
    ) -> anyhow::Result<(HashInfo, u64)> {
        let rel_str = key_to_string(&key_from_path(rel_path));

        if let Some(hash) = state.get(&rel_str, metadata) {
            return Ok((hash.clone(), metadata.len()));
        }

        let (hash, size) = hash_file(&self.abs(rel_path))
            .with_context(|| format!("Unable to hash {}", rel_path.display()))?;
        state.record(rel_str, metadata, hash.clone());

        Ok((hash, size))
    }

    /// Remove a workspace path. Missing paths are fine: removal is part of
    /// reconciliation, not an assertion about current state.
    pub fn remove(&self, rel_path: &Path) -> anyhow::Result<()> {
        let abs = self.abs(rel_path);

        match std::fs::symlink_metadata(&abs) {
            Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(&abs)
                .with_context(|| format!("Unable to remove directory {}", abs.display())),
            Ok(_) => std::fs::remove_file(&abs)
                .with_context(|| format!("Unable to remove file {}", abs.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Unable to stat {}", abs.display()))
            }
        }
    }

    pub fn make_parent_dirs(&self, rel_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = self.abs(rel_path).parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Unable to create directory {}", parent.display()))?;
        }
        Ok(())
    }

    pub fn make_dir(&self, rel_path: &Path) -> anyhow::Result<()> {
        let abs = self.abs(rel_path);
        std::fs::create_dir_all(&abs)
            .with_context(|| format!("Unable to create directory {}", abs.display()))
    }
}
