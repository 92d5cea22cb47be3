//! Content identity
//!
//! Every cached object is addressed by the pair of a hash algorithm and a
//! hex digest. A digest carrying the `.dir` suffix identifies a directory
//! aggregate: the hash of a serialized tree object rather than of raw file
//! bytes.
//!
//! ## Storage
//!
//! Objects are stored in `<cache>/<first-2-chars>/<remaining-chars>`

use serde::{Deserialize, Serialize};

/// Suffix marking a directory-aggregate digest.
pub const DIR_SUFFIX: &str = ".dir";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Identity of one cached object
///
/// Compared structurally; immutable once computed. The `value` is lowercase
/// hex, optionally suffixed with `.dir` for directory aggregates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HashInfo {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

impl HashInfo {
    pub fn new(algorithm: HashAlgorithm, value: String) -> Self {
        HashInfo { algorithm, value }
    }

    /// Build from raw digest bytes, hex-encoding the value.
    pub fn from_digest(algorithm: HashAlgorithm, digest: &[u8]) -> Self {
        HashInfo {
            algorithm,
            value: hex::encode(digest),
        }
    }

    /// Mark this digest as a directory aggregate.
    pub fn into_dir(mut self) -> Self {
        if !self.value.ends_with(DIR_SUFFIX) {
            self.value.push_str(DIR_SUFFIX);
        }
        self
    }

    pub fn is_dir(&self) -> bool {
        self.value.ends_with(DIR_SUFFIX)
    }

    /// The digest without the `.dir` suffix, i.e. the on-disk object name.
    pub fn file_value(&self) -> &str {
        self.value.strip_suffix(DIR_SUFFIX).unwrap_or(&self.value)
    }
}

impl std::fmt::Display for HashInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}
