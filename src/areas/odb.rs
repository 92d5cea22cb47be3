//! Content-addressed object database
//!
//! Maps a hash digest to a canonical on-disk path under a two-hex-character
//! fan-out (`xx/yyyy...`), which keeps any single directory from
//! accumulating millions of entries. Objects are immutable: written once
//! via stage-then-atomic-rename, protected read-only, and removed only by
//! garbage collection.
//!
//! Multiple workspaces may share one database; nothing in here references a
//! workspace.

use crate::artifacts::core::run_jobs;
use crate::artifacts::hash::hash_info::{HashAlgorithm, HashInfo};
use crate::artifacts::hash::tree::Tree;
use crate::artifacts::index::index_entry::IndexEntry;
use anyhow::Context;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct Odb {
    root: Box<Path>,
    algorithm: HashAlgorithm,
}

impl Odb {
    pub fn new(root: Box<Path>) -> Self {
        Odb {
            root,
            algorithm: HashAlgorithm::Md5,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Canonical fan-out path for a digest. Pure, no I/O.
    pub fn path_for(&self, value: &str) -> PathBuf {
        let (dir, file) = value.split_at(2.min(value.len()));
        self.root.join(dir).join(file)
    }

    /// Existence of one object. An I/O error other than "not found" is an
    /// error, never a false negative.
    pub fn exists(&self, value: &str) -> anyhow::Result<bool> {
        match std::fs::metadata(self.path_for(value)) {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("Unable to check object {}", value)),
        }
    }

    /// Bulk existence check over the worker pool.
    ///
    /// Returns the subset of `values` that exist. If any single probe fails
    /// the whole batch fails: unchecked hashes must never be reported
    /// absent, or GC and checkout would act on bad data.
    pub fn exists_batch(
        &self,
        values: &[String],
        jobs: usize,
    ) -> anyhow::Result<HashSet<String>> {
        let probes = run_jobs(values.to_vec(), jobs, |value| {
            let present = self.exists(&value);
            (value, present)
        });

        let mut present = HashSet::new();
        for (value, probe) in probes {
            if probe? {
                present.insert(value);
            }
        }
        Ok(present)
    }

    /// Store a file's content under its digest.
    ///
    /// The content is staged under a temporary name and atomically renamed
    /// into the fan-out location, so a concurrent reader never observes a
    /// partial write. Concurrent adds of the same hash are benign: the
    /// content is identical by construction and last rename wins.
    pub fn add_file(&self, src: &Path, hash: &HashInfo) -> anyhow::Result<PathBuf> {
        let object_path = self.path_for(hash.file_value());

        if !object_path.exists() {
            let staged = self.stage_path()?;
            std::fs::copy(src, &staged).with_context(|| {
                format!("Unable to stage {} into the cache", src.display())
            })?;
            self.commit_staged(&staged, &object_path)?;
            debug!(object = %hash, "stored file object");
        }

        Ok(object_path)
    }

    /// Store an in-memory blob (tree objects) under its digest.
    pub fn add_bytes(&self, data: &[u8], hash: &HashInfo) -> anyhow::Result<PathBuf> {
        let object_path = self.path_for(hash.file_value());

        if !object_path.exists() {
            let staged = self.stage_path()?;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&staged)
                .with_context(|| format!("Unable to open staging file {}", staged.display()))?;
            file.write_all(data)
                .with_context(|| format!("Unable to write staging file {}", staged.display()))?;
            drop(file);
            self.commit_staged(&staged, &object_path)?;
            debug!(object = %hash, "stored blob object");
        }

        Ok(object_path)
    }

    // staging files live directly under the root, which does not exist
    // before the first add
    fn stage_path(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("Unable to create object store root {}", self.root.display())
        })?;
        Ok(self.root.join(format!("tmp-obj-{}", Uuid::new_v4())))
    }

    fn commit_staged(&self, staged: &Path, object_path: &Path) -> anyhow::Result<()> {
        let object_dir = object_path
            .parent()
            .context(format!("Invalid object path {}", object_path.display()))?;
        std::fs::create_dir_all(object_dir).context(format!(
            "Unable to create object directory {}",
            object_dir.display()
        ))?;

        // rename the staged file into place to make the write atomic
        std::fs::rename(staged, object_path).context(format!(
            "Unable to rename staged object to {}",
            object_path.display()
        ))?;

        self.set_readonly(object_path, true)
    }

    /// Serialize and store a directory tree object, returning its digest.
    pub fn store_tree(&self, tree: &Tree) -> anyhow::Result<HashInfo> {
        let hash = tree.digest()?;
        self.add_bytes(&tree.serialize()?, &hash)?;
        Ok(hash)
    }

    /// Load a directory tree object by its aggregate digest.
    pub fn load_tree(&self, hash: &HashInfo) -> anyhow::Result<Tree> {
        let object_path = self.path_for(hash.file_value());
        let data = std::fs::read(&object_path)
            .with_context(|| format!("Unable to read tree object {}", hash))?;
        Tree::deserialize(&data)
    }

    /// Mark the canonical copy read-only: shared cache content is not to be
    /// edited in place.
    pub fn protect(&self, value: &str) -> anyhow::Result<()> {
        self.set_readonly(&self.path_for(value), true)
    }

    /// Clear the read-only bit, e.g. right before a copy is re-linked for
    /// in-place edits.
    pub fn unprotect(&self, value: &str) -> anyhow::Result<()> {
        self.set_readonly(&self.path_for(value), false)
    }

    fn set_readonly(&self, path: &Path, readonly: bool) -> anyhow::Result<()> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Unable to stat object {}", path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_readonly(readonly);
        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Unable to set permissions on {}", path.display()))?;
        Ok(())
    }

    /// Whether an entry's content is recoverable from this store: the file
    /// object itself, or for directories the tree object.
    pub fn contains_entry(&self, entry: &IndexEntry) -> anyhow::Result<bool> {
        match &entry.hash {
            None => Ok(false),
            Some(hash) => self.exists(hash.file_value()),
        }
    }

    /// Every digest currently stored, from walking the fan-out directories.
    pub fn all_hashes(&self) -> anyhow::Result<Vec<String>> {
        let mut hashes = Vec::new();

        if !self.root.exists() {
            return Ok(hashes);
        }

        for dir_entry in std::fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let dir_name = dir_entry.file_name().to_string_lossy().into_owned();

            // only two-hex-char fan-out directories hold objects
            if dir_name.len() != 2
                || !dir_name.chars().all(|c| c.is_ascii_hexdigit())
                || !dir_entry.file_type()?.is_dir()
            {
                continue;
            }

            for object in std::fs::read_dir(dir_entry.path())? {
                let object = object?;
                if object.file_type()?.is_file() {
                    hashes.push(format!(
                        "{}{}",
                        dir_name,
                        object.file_name().to_string_lossy()
                    ));
                }
            }
        }

        Ok(hashes)
    }

    /// Delete every object whose digest is not in `keep`.
    ///
    /// Callers must snapshot the in-use set before calling and must not
    /// expect objects added mid-pass to survive without re-verification.
    pub fn gc(&self, keep: &HashSet<String>) -> anyhow::Result<usize> {
        let mut removed = 0;

        for value in self.all_hashes()? {
            if keep.contains(&value) {
                continue;
            }

            let object_path = self.path_for(&value);
            // clear the read-only bit first so removal works everywhere
            self.set_readonly(&object_path, false)?;
            std::fs::remove_file(&object_path)
                .with_context(|| format!("Unable to remove object {}", value))?;
            debug!(object = %value, "removed unreferenced object");
            removed += 1;

            if let Some(fanout_dir) = object_path.parent()
                && std::fs::read_dir(fanout_dir)?.next().is_none()
            {
                std::fs::remove_dir(fanout_dir)?;
            }
        }

        Ok(removed)
    }
}
