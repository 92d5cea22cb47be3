pub mod hash_info;
pub mod tree;

use crate::artifacts::hash::hash_info::{HashAlgorithm, HashInfo};
use anyhow::Context;
use md5::{Digest, Md5};
use std::io::Read;
use std::path::Path;

const HASH_BUF_SIZE: usize = 64 * 1024;

/// Hash a byte slice. Deterministic: equal bytes yield equal HashInfo.
pub fn hash_bytes(data: &[u8]) -> HashInfo {
    let mut hasher = Md5::new();
    hasher.update(data);
    HashInfo::from_digest(HashAlgorithm::Md5, &hasher.finalize())
}

/// Hash a file's content with a streaming read.
///
/// Returns the digest together with the file size so callers can stamp
/// entry metadata without a second stat.
pub fn hash_file(path: &Path) -> anyhow::Result<(HashInfo, u64)> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Unable to open file for hashing: {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = [0u8; HASH_BUF_SIZE];
    let mut size: u64 = 0;

    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("Unable to read file for hashing: {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((
        HashInfo::from_digest(HashAlgorithm::Md5, &hasher.finalize()),
        size,
    ))
}
