//! Index entry representation
//!
//! Each entry tracks one file or directory by an ordered tuple of path
//! segments (the key), a metadata stamp and an optional content digest.
//! Directory entries carry a `.dir` aggregate digest derived from their
//! children; entries with no digest have never been hashed.

use crate::artifacts::hash::hash_info::HashInfo;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Ordered path-segment tuple, relative to the workspace root.
pub type Key = Vec<String>;

/// Build a key from a relative path, dropping non-normal components.
pub fn key_from_path(path: &Path) -> Key {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

pub fn key_to_path(key: &Key) -> PathBuf {
    key.iter().collect()
}

/// Display form of a key, `/`-separated regardless of platform.
pub fn key_to_string(key: &Key) -> String {
    key.join("/")
}

/// True when `key` lies under `prefix` (or equals it).
pub fn key_has_prefix(key: &Key, prefix: &Key) -> bool {
    key.len() >= prefix.len() && key[..prefix.len()] == prefix[..]
}

/// Metadata stamp for one tracked entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub size: u64,
    pub is_dir: bool,
    pub is_exec: bool,
    /// Version id for cloud-versioned storage backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: Key,
    pub meta: Meta,
    pub hash: Option<HashInfo>,
}

impl IndexEntry {
    pub fn new(key: Key, meta: Meta, hash: Option<HashInfo>) -> Self {
        IndexEntry { key, meta, hash }
    }

    pub fn is_dir(&self) -> bool {
        self.meta.is_dir
    }

    pub fn rel_path(&self) -> PathBuf {
        key_to_path(&self.key)
    }

    /// All strict prefixes of this entry's key, shortest first.
    pub fn parent_keys(&self) -> Vec<Key> {
        (1..self.key.len())
            .map(|len| self.key[..len].to_vec())
            .collect()
    }
}
