//! Link strategies and per-volume negotiation
//!
//! Materializing a cached object into the workspace tries the cheapest
//! operation the volume pair supports: hardlink, then symlink, then
//! reflink, then a plain copy. Whether a strategy can work at all is a
//! property of the (cache volume, workspace volume) pair — e.g. hardlinks
//! never work across devices — so the first strategy that succeeds is
//! cached per pair for the rest of the operation instead of failing the
//! same syscall once per file.

use anyhow::Context;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Hardlink,
    Symlink,
    Reflink,
    Copy,
}

impl LinkType {
    /// Configured preference order, cheapest first.
    pub const DEFAULT_ORDER: [LinkType; 4] = [
        LinkType::Hardlink,
        LinkType::Symlink,
        LinkType::Reflink,
        LinkType::Copy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LinkType::Hardlink => "hardlink",
            LinkType::Symlink => "symlink",
            LinkType::Reflink => "reflink",
            LinkType::Copy => "copy",
        }
    }

    fn apply(&self, src: &Path, dst: &Path) -> io::Result<()> {
        match self {
            LinkType::Hardlink => std::fs::hard_link(src, dst),
            LinkType::Symlink => symlink(src, dst),
            LinkType::Reflink => reflink(src, dst),
            LinkType::Copy => std::fs::copy(src, dst).map(|_| ()),
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

#[cfg(target_os = "linux")]
fn reflink(src: &Path, dst: &Path) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    const FICLONE: libc::c_ulong = 0x4004_9409;

    let src_file = std::fs::File::open(src)?;
    let dst_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;

    let rc = unsafe { libc::ioctl(dst_file.as_raw_fd(), FICLONE, src_file.as_raw_fd()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        drop(dst_file);
        let _ = std::fs::remove_file(dst);
        return Err(err);
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn reflink(_src: &Path, _dst: &Path) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}

/// Volume identity of a path (device id on unix). The destination does not
/// exist yet, so its parent directory is probed instead.
fn volume_of(path: &Path, probe_parent: bool) -> u64 {
    let probe: &Path = if probe_parent {
        path.parent().unwrap_or(path)
    } else {
        path
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(probe).map(|m| m.dev()).unwrap_or(0)
    }
    #[cfg(not(unix))]
    {
        let _ = probe;
        0
    }
}

/// Picks and remembers a working link strategy per volume pair.
///
/// Shared across the checkout worker pool: two workers hitting an
/// unseen pair at the same time may both negotiate it, but they land on
/// the same strategy, so the duplicate probe is harmless.
#[derive(Debug)]
pub struct LinkNegotiator {
    order: Vec<LinkType>,
    negotiated: Mutex<HashMap<(u64, u64), LinkType>>,
}

impl LinkNegotiator {
    pub fn new(order: Vec<LinkType>) -> Self {
        LinkNegotiator {
            order,
            negotiated: Mutex::new(HashMap::new()),
        }
    }

    /// Materialize `dst` from `src`, returning the strategy used.
    ///
    /// The first strategy that succeeds for this volume pair is reused for
    /// every later file on the same pair. A failure of an already
    /// negotiated strategy (permissions, disk full) propagates to the
    /// caller as a per-entry error instead of re-opening negotiation.
    pub fn link(&self, src: &Path, dst: &Path) -> anyhow::Result<LinkType> {
        let pair = (volume_of(src, false), volume_of(dst, true));

        if let Some(link_type) = self.negotiated_for(pair) {
            link_type.apply(src, dst).with_context(|| {
                format!("Unable to {} {} into place", link_type, dst.display())
            })?;
            return Ok(link_type);
        }

        let mut last_error = None;
        for link_type in &self.order {
            match link_type.apply(src, dst) {
                Ok(()) => {
                    debug!(strategy = %link_type, "negotiated link strategy");
                    self.remember(pair, *link_type);
                    return Ok(*link_type);
                }
                Err(err) => {
                    debug!(strategy = %link_type, error = %err, "link strategy rejected");
                    last_error = Some(err);
                }
            }
        }

        Err(anyhow::anyhow!(
            "No link strategy succeeded for {}: {}",
            dst.display(),
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no strategies configured".to_string())
        ))
    }

    fn negotiated_for(&self, pair: (u64, u64)) -> Option<LinkType> {
        self.negotiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pair)
            .copied()
    }

    fn remember(&self, pair: (u64, u64), link_type: LinkType) {
        self.negotiated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair, link_type);
    }
}

impl Default for LinkNegotiator {
    fn default() -> Self {
        LinkNegotiator::new(LinkType::DEFAULT_ORDER.to_vec())
    }
}
