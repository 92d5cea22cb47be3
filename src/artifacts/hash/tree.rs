//! Tree objects (directory aggregates)
//!
//! A directory's cache object is a serialized listing of its files:
//! relative path, content digest, size and the executable bit. The listing
//! is sorted by relative path before serialization so that the directory
//! digest is a pure function of the set of `(relpath, hash)` pairs — file
//! order on disk never changes it. Given the digest, the whole directory
//! can be reconstructed from the cache without re-walking the source.

use crate::artifacts::hash::hash_bytes;
use crate::artifacts::hash::hash_info::HashInfo;
use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One file inside a directory aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path relative to the directory root, `/`-separated.
    pub relpath: String,
    /// Hex digest of the file content (no `.dir` suffix, files only).
    pub hash: String,
    pub size: u64,
    pub is_executable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        Tree { entries }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size).sum()
    }

    /// Canonical serialized form: a JSON array sorted by relpath.
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&self.entries).context("Unable to serialize tree object")
    }

    pub fn deserialize(data: &[u8]) -> anyhow::Result<Self> {
        let entries: Vec<TreeEntry> =
            serde_json::from_slice(data).context("Unable to parse tree object")?;
        Ok(Tree::from_entries(entries))
    }

    /// Directory digest: the hash of the canonical serialized listing,
    /// marked with the `.dir` suffix.
    pub fn digest(&self) -> anyhow::Result<HashInfo> {
        Ok(hash_bytes(&self.serialize()?).into_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    #[fixture]
    fn entries() -> Vec<TreeEntry> {
        vec![
            TreeEntry {
                relpath: "b.txt".to_string(),
                hash: "bb".to_string(),
                size: 2,
                is_executable: false,
            },
            TreeEntry {
                relpath: "a.txt".to_string(),
                hash: "aa".to_string(),
                size: 1,
                is_executable: true,
            },
        ]
    }

    #[rstest]
    fn digest_ignores_entry_order(entries: Vec<TreeEntry>) {
        let forward = Tree::from_entries(entries.clone());
        let mut reversed = entries;
        reversed.reverse();
        let reversed = Tree::from_entries(reversed);

        assert_eq!(forward.digest().unwrap(), reversed.digest().unwrap());
    }

    #[rstest]
    fn digest_changes_with_content(entries: Vec<TreeEntry>) {
        let original = Tree::from_entries(entries.clone());
        let mut changed = entries;
        changed[0].hash = "cc".to_string();
        let changed = Tree::from_entries(changed);

        assert_ne!(original.digest().unwrap(), changed.digest().unwrap());
    }

    #[rstest]
    fn serialization_round_trip(entries: Vec<TreeEntry>) {
        let tree = Tree::from_entries(entries);
        let data = tree.serialize().unwrap();

        assert_eq!(Tree::deserialize(&data).unwrap(), tree);
    }

    #[rstest]
    fn digest_is_marked_as_dir(entries: Vec<TreeEntry>) {
        assert!(Tree::from_entries(entries).digest().unwrap().is_dir());
    }
}
