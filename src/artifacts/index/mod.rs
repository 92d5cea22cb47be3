//! Tracked-entry index
//!
//! An index maps path keys to entries and is rebuilt per operation: the
//! "old" index from walking the live workspace, the "new" index from
//! persisted tracked metadata. Keys are unique within one index, and a
//! directory entry's children are strict key extensions of the parent.
//!
//! The parent/child bookkeeping mirrors the conflict rules of a staging
//! area: adding `a/b` as a file evicts an entry at `a`, and adding `a`
//! evicts everything under it.

pub mod index_entry;

use crate::artifacts::hash::tree::{Tree, TreeEntry};
use crate::artifacts::index::index_entry::{IndexEntry, Key, key_has_prefix, key_to_string};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Index {
    /// Tracked entries mapped by key, sorted.
    entries: BTreeMap<Key, IndexEntry>,
    /// Directory hierarchy for parent-child lookups.
    children: BTreeMap<Key, BTreeSet<Key>>,
}

impl Index {
    pub fn new() -> Self {
        Index::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = IndexEntry>) -> Self {
        let mut index = Index::new();
        for entry in entries {
            index.add(entry);
        }
        index
    }

    pub fn get(&self, key: &Key) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub fn into_entries(self) -> impl Iterator<Item = IndexEntry> {
        self.entries.into_values()
    }

    /// Add an entry, evicting any conflicting parent or child entries.
    pub fn add(&mut self, entry: IndexEntry) {
        self.discard_conflicts(&entry);
        self.store_entry(entry);
    }

    /// Remove the entry at `key` and everything tracked under it.
    pub fn remove(&mut self, key: &Key) {
        self.remove_entry(key);
        self.remove_children(key);
    }

    fn discard_conflicts(&mut self, entry: &IndexEntry) {
        for parent in entry.parent_keys() {
            // a parent that exists as a file entry is in the way,
            // unless it is the directory aggregate this entry belongs to
            if let Some(existing) = self.entries.get(&parent)
                && !existing.is_dir()
            {
                self.remove_entry(&parent);
            }
        }
        if !entry.is_dir() {
            self.remove_children(&entry.key);
        }
    }

    fn store_entry(&mut self, entry: IndexEntry) {
        for parent in entry.parent_keys() {
            self.children
                .entry(parent)
                .or_default()
                .insert(entry.key.clone());
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    fn remove_children(&mut self, key: &Key) {
        if let Some(children) = self.children.remove(key) {
            for child in children {
                self.remove_entry(&child);
            }
        }
    }

    fn remove_entry(&mut self, key: &Key) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };

        for parent in entry.parent_keys() {
            if let Some(children) = self.children.get_mut(&parent) {
                children.remove(key);
                if children.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
    }

    /// Entries strictly under `key`, in key order.
    pub fn entries_under(&self, key: &Key) -> Vec<&IndexEntry> {
        self.entries
            .iter()
            .filter(|(entry_key, _)| entry_key.len() > key.len() && key_has_prefix(entry_key, key))
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Keys with no ancestor entry in this index, i.e. the tracked outputs.
    pub fn root_keys(&self) -> Vec<Key> {
        self.entries
            .keys()
            .filter(|key| {
                (1..key.len()).all(|len| !self.entries.contains_key(&key[..len].to_vec()))
            })
            .cloned()
            .collect()
    }

    /// The tracked output a key belongs to: its shortest tracked prefix.
    pub fn root_of(&self, key: &Key) -> Key {
        for len in 1..key.len() {
            let prefix = key[..len].to_vec();
            if self.entries.contains_key(&prefix) {
                return prefix;
            }
        }
        key.clone()
    }

    /// Rebuild the tree object for the directory entry at `dir_key` from
    /// the child entries currently in the index.
    pub fn tree_of(&self, dir_key: &Key) -> anyhow::Result<Tree> {
        let mut entries = Vec::new();

        for child in self.entries_under(dir_key) {
            if child.is_dir() {
                continue;
            }
            let hash = child.hash.as_ref().ok_or_else(|| {
                anyhow::anyhow!("Entry {} has no recorded hash", key_to_string(&child.key))
            })?;
            entries.push(TreeEntry {
                relpath: child.key[dir_key.len()..].join("/"),
                hash: hash.file_value().to_string(),
                size: child.meta.size,
                is_executable: child.meta.is_exec,
            });
        }

        Ok(Tree::from_entries(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::index::index_entry::Meta;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn key(parts: &[&str]) -> Key {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn file_entry(parts: &[&str]) -> IndexEntry {
        IndexEntry::new(key(parts), Meta::default(), None)
    }

    fn dir_entry(parts: &[&str]) -> IndexEntry {
        IndexEntry::new(
            key(parts),
            Meta {
                is_dir: true,
                ..Default::default()
            },
            None,
        )
    }

    #[rstest]
    fn adding_a_file_evicts_a_stale_file_parent() {
        let mut index = Index::new();
        index.add(file_entry(&["a"]));
        index.add(file_entry(&["a", "b"]));

        assert!(!index.contains(&key(&["a"])));
        assert!(index.contains(&key(&["a", "b"])));
    }

    #[rstest]
    fn adding_a_file_over_a_directory_evicts_the_children() {
        let mut index = Index::new();
        index.add(dir_entry(&["a"]));
        index.add(file_entry(&["a", "b"]));
        index.add(file_entry(&["a", "c"]));

        index.add(file_entry(&["a"]));

        assert!(index.contains(&key(&["a"])));
        assert!(!index.contains(&key(&["a", "b"])));
        assert!(!index.contains(&key(&["a", "c"])));
    }

    #[rstest]
    fn directory_parent_survives_child_addition() {
        let mut index = Index::new();
        index.add(dir_entry(&["data"]));
        index.add(file_entry(&["data", "raw.csv"]));

        assert!(index.contains(&key(&["data"])));
        assert!(index.contains(&key(&["data", "raw.csv"])));
    }

    #[rstest]
    fn remove_drops_children_too() {
        let mut index = Index::new();
        index.add(dir_entry(&["data"]));
        index.add(file_entry(&["data", "a"]));
        index.add(file_entry(&["data", "b"]));

        index.remove(&key(&["data"]));

        assert!(index.is_empty());
    }

    #[rstest]
    fn root_keys_skip_tracked_children() {
        let mut index = Index::new();
        index.add(dir_entry(&["data"]));
        index.add(file_entry(&["data", "a"]));
        index.add(file_entry(&["model.bin"]));

        assert_eq!(index.root_keys(), vec![key(&["data"]), key(&["model.bin"])]);
        assert_eq!(index.root_of(&key(&["data", "a"])), key(&["data"]));
    }
}
