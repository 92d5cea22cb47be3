//! Path-scoped multi-process read/write lock
//!
//! Cooperating processes on one machine serialize mutating operations
//! through a JSON file recording, per path, the current readers and the
//! single writer. The JSON itself is not safe for concurrent structural
//! edits, so every read-modify-write cycle runs under a secondary guard
//! lock: an advisory file lock by default, or a hardlink-based guard for
//! filesystems where advisory locks are unreliable.
//!
//! A path may have many readers but at most one writer; a writer conflicts
//! with any overlapping reader or writer. Overlap is containment in either
//! direction — a lock on a parent directory blocks locks on its children
//! and vice versa. Entries belonging to dead processes are pruned
//! automatically, so crashed holders never require manual cleanup.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

const GUARD_RETRIES: u32 = 50;
const GUARD_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(10);

/// Identity of one lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub cmd: String,
}

impl LockInfo {
    pub fn for_current_process() -> Self {
        LockInfo {
            pid: std::process::id(),
            cmd: std::env::args().collect::<Vec<_>>().join(" "),
        }
    }
}

#[derive(Debug, Error)]
#[error("'{path}' is busy: locked for {action} by pid {pid} (`{cmd}`)")]
pub struct LockContention {
    pub path: String,
    pub action: &'static str,
    pub pid: u32,
    pub cmd: String,
}

/// On-disk schema: readers and writer per normalized path.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LockFileContent {
    #[serde(default)]
    read: BTreeMap<String, Vec<LockInfo>>,
    #[serde(default)]
    write: BTreeMap<String, LockInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuardKind {
    #[default]
    Flock,
    Hardlink,
}

#[derive(Debug)]
pub struct RwLock {
    path: Box<Path>,
    guard_kind: GuardKind,
    info: LockInfo,
}

/// Normalize a relative path into the `/`-separated form used as a lock
/// key. The workspace root normalizes to the empty string, which overlaps
/// everything.
fn normalize(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            std::path::Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Containment in either direction, by whole path segments.
fn paths_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() || a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long.starts_with(short) && long.as_bytes()[short.len()] == b'/'
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    // EPERM means the process exists but belongs to someone else
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // no cheap liveness probe: over-blocking beats false pruning
    true
}

impl RwLock {
    pub fn new(path: Box<Path>, guard_kind: GuardKind) -> Self {
        RwLock {
            path,
            guard_kind,
            info: LockInfo::for_current_process(),
        }
    }

    /// Take read intents on `read_paths` and write intents on
    /// `write_paths`.
    ///
    /// Fails immediately on conflict instead of spinning; callers retry or
    /// surface the contention to the user. The returned guard releases the
    /// intents on drop.
    pub fn acquire(
        &self,
        read_paths: &[PathBuf],
        write_paths: &[PathBuf],
    ) -> anyhow::Result<RwLockGuard<'_>> {
        let read: Vec<String> = read_paths.iter().map(|p| normalize(p)).collect();
        let write: Vec<String> = write_paths.iter().map(|p| normalize(p)).collect();

        let _guard = self.guard_lock()?;
        let mut content = self.load()?;
        self.prune_stale(&mut content);

        for path in &write {
            self.check_writer_overlap(&content, path)?;
            self.check_reader_overlap(&content, path)?;
        }
        for path in &read {
            self.check_writer_overlap(&content, path)?;
        }

        for path in &write {
            content.write.insert(path.clone(), self.info.clone());
        }
        for path in &read {
            let holders = content.read.entry(path.clone()).or_default();
            if !holders.contains(&self.info) {
                holders.push(self.info.clone());
            }
        }

        self.store(&content)?;

        Ok(RwLockGuard {
            lock: self,
            read,
            write,
        })
    }

    fn check_writer_overlap(&self, content: &LockFileContent, path: &str) -> anyhow::Result<()> {
        for (held, info) in &content.write {
            if info.pid != self.info.pid && paths_overlap(held, path) {
                return Err(LockContention {
                    path: held.clone(),
                    action: "writing",
                    pid: info.pid,
                    cmd: info.cmd.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn check_reader_overlap(&self, content: &LockFileContent, path: &str) -> anyhow::Result<()> {
        for (held, holders) in &content.read {
            if !paths_overlap(held, path) {
                continue;
            }
            if let Some(info) = holders.iter().find(|info| info.pid != self.info.pid) {
                return Err(LockContention {
                    path: held.clone(),
                    action: "reading",
                    pid: info.pid,
                    cmd: info.cmd.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Drop entries whose holder is no longer alive. Lock files must
    /// self-heal after a crashed process.
    fn prune_stale(&self, content: &mut LockFileContent) {
        content.write.retain(|path, info| {
            let alive = info.pid == self.info.pid || pid_alive(info.pid);
            if !alive {
                warn!(path = %path, pid = info.pid, "pruning stale write lock");
            }
            alive
        });
        content.read.retain(|path, holders| {
            holders.retain(|info| {
                let alive = info.pid == self.info.pid || pid_alive(info.pid);
                if !alive {
                    warn!(path = %path, pid = info.pid, "pruning stale read lock");
                }
                alive
            });
            !holders.is_empty()
        });
    }

    /// Remove exactly the entries this process recorded; idempotent.
    fn release(&self, read: &[String], write: &[String]) -> anyhow::Result<()> {
        let _guard = self.guard_lock()?;
        let mut content = self.load()?;

        for path in write {
            if content.write.get(path) == Some(&self.info) {
                content.write.remove(path);
            }
        }
        for path in read {
            if let Some(holders) = content.read.get_mut(path) {
                holders.retain(|info| info != &self.info);
                if holders.is_empty() {
                    content.read.remove(path);
                }
            }
        }

        self.store(&content)
    }

    fn load(&self) -> anyhow::Result<LockFileContent> {
        match std::fs::read(&self.path) {
            Ok(data) if data.is_empty() => Ok(LockFileContent::default()),
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("Corrupt lock file {}", self.path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(LockFileContent::default())
            }
            Err(err) => Err(err)
                .with_context(|| format!("Unable to read lock file {}", self.path.display())),
        }
    }

    fn store(&self, content: &LockFileContent) -> anyhow::Result<()> {
        let data = serde_json::to_vec(content).context("Unable to serialize lock file")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("Unable to write lock file {}", self.path.display()))
    }

    fn guard_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rwlock".to_string());
        name.push_str(".lock");
        self.path.with_file_name(name)
    }

    fn guard_lock(&self) -> anyhow::Result<GuardHandle> {
        match self.guard_kind {
            GuardKind::Flock => {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(self.guard_path())
                    .with_context(|| {
                        format!("Unable to open guard lock {}", self.guard_path().display())
                    })?;
                let guard = file_guard::lock(Box::new(file), file_guard::Lock::Exclusive, 0, 1)
                    .context("Unable to take the guard lock")?;
                Ok(GuardHandle::Flock { _guard: guard })
            }
            GuardKind::Hardlink => self.hardlink_guard(),
        }
    }

    // hardlink creation is atomic even on filesystems where advisory
    // locks are not; the link either lands or already exists
    fn hardlink_guard(&self) -> anyhow::Result<GuardHandle> {
        let lock_path = self.guard_path();
        let tmp_path = self
            .path
            .with_file_name(format!("rwlock.{}.tmp", self.info.pid));
        std::fs::write(&tmp_path, self.info.pid.to_string())
            .with_context(|| format!("Unable to write {}", tmp_path.display()))?;

        for _ in 0..GUARD_RETRIES {
            match std::fs::hard_link(&tmp_path, &lock_path) {
                Ok(()) => {
                    return Ok(GuardHandle::Hardlink {
                        lock_path,
                        tmp_path,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(GUARD_RETRY_DELAY);
                }
                Err(err) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    return Err(err).with_context(|| {
                        format!("Unable to take hardlink guard {}", lock_path.display())
                    });
                }
            }
        }

        let _ = std::fs::remove_file(&tmp_path);
        anyhow::bail!(
            "Guard lock {} is busy, another process is editing the lock file",
            lock_path.display()
        )
    }
}

enum GuardHandle {
    Flock {
        _guard: file_guard::FileGuard<Box<std::fs::File>>,
    },
    Hardlink {
        lock_path: PathBuf,
        tmp_path: PathBuf,
    },
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        if let GuardHandle::Hardlink {
            lock_path,
            tmp_path,
        } = self
        {
            let _ = std::fs::remove_file(lock_path);
            let _ = std::fs::remove_file(tmp_path);
        }
    }
}

/// Held lock intents; releases on drop.
#[derive(Debug)]
#[must_use]
pub struct RwLockGuard<'l> {
    lock: &'l RwLock,
    read: Vec<String>,
    write: Vec<String>,
}

impl Drop for RwLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release(&self.read, &self.write) {
            warn!(error = %err, "failed to release rwlock entries");
        }
    }
}
