//! File hash state cache
//!
//! Hashing is the expensive step of building a workspace index. This cache
//! maps a relative path to the digest observed at a given (mtime, size)
//! pair; when both cheap signals still match, the stored digest is reused
//! and the file is not re-read.

use crate::artifacts::hash::hash_info::HashInfo;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub mtime_ns: u64,
    pub size: u64,
    pub hash: HashInfo,
}

#[derive(Debug)]
pub struct StateCache {
    path: Box<Path>,
    entries: HashMap<String, StateEntry>,
    changed: bool,
}

fn mtime_ns(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or_default()
}

impl StateCache {
    /// Load the cache from disk; a missing file is an empty cache.
    pub fn load(path: Box<Path>) -> anyhow::Result<Self> {
        let entries = match std::fs::read(&path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Corrupt state cache {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Unable to read state cache {}", path.display()));
            }
        };

        Ok(StateCache {
            path,
            entries,
            changed: false,
        })
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        if !self.changed {
            return Ok(());
        }

        let data = serde_json::to_vec(&self.entries).context("Unable to serialize state cache")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("Unable to write state cache {}", self.path.display()))?;
        self.changed = false;

        Ok(())
    }

    /// Cached digest for `rel_path`, only when mtime and size both still
    /// match the live metadata.
    pub fn get(&self, rel_path: &str, metadata: &std::fs::Metadata) -> Option<&HashInfo> {
        let entry = self.entries.get(rel_path)?;
        if entry.mtime_ns == mtime_ns(metadata) && entry.size == metadata.len() {
            Some(&entry.hash)
        } else {
            None
        }
    }

    pub fn record(&mut self, rel_path: String, metadata: &std::fs::Metadata, hash: HashInfo) {
        self.entries.insert(
            rel_path,
            StateEntry {
                mtime_ns: mtime_ns(metadata),
                size: metadata.len(),
                hash,
            },
        );
        self.changed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::hash::hash_bytes;
    use pretty_assertions::assert_eq;

    #[test]
    fn hit_only_while_mtime_and_size_match() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("data.txt");
        std::fs::write(&file_path, b"v1").unwrap();
        let metadata = std::fs::metadata(&file_path).unwrap();

        let mut cache =
            StateCache::load(dir.path().join("state.json").into_boxed_path()).unwrap();
        cache.record("data.txt".to_string(), &metadata, hash_bytes(b"v1"));

        assert_eq!(cache.get("data.txt", &metadata), Some(&hash_bytes(b"v1")));

        // size change invalidates the entry
        std::fs::write(&file_path, b"longer content").unwrap();
        let changed = std::fs::metadata(&file_path).unwrap();
        assert_eq!(cache.get("data.txt", &changed), None);
    }

    #[test]
    fn mtime_change_alone_invalidates_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("data.txt");
        std::fs::write(&file_path, b"v1").unwrap();
        let metadata = std::fs::metadata(&file_path).unwrap();

        let mut cache =
            StateCache::load(dir.path().join("state.json").into_boxed_path()).unwrap();
        cache.record("data.txt".to_string(), &metadata, hash_bytes(b"v1"));

        // same size, different mtime
        filetime::set_file_mtime(&file_path, filetime::FileTime::from_unix_time(1, 0)).unwrap();
        let touched = std::fs::metadata(&file_path).unwrap();

        assert_eq!(cache.get("data.txt", &touched), None);
    }

    #[test]
    fn survives_a_save_load_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("data.txt");
        std::fs::write(&file_path, b"v1").unwrap();
        let metadata = std::fs::metadata(&file_path).unwrap();
        let state_path = dir.path().join("state.json").into_boxed_path();

        let mut cache = StateCache::load(state_path.clone()).unwrap();
        cache.record("data.txt".to_string(), &metadata, hash_bytes(b"v1"));
        cache.save().unwrap();

        let reloaded = StateCache::load(state_path).unwrap();
        assert_eq!(reloaded.get("data.txt", &metadata), Some(&hash_bytes(b"v1")));
    }
}
