use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use stackward_core::UpgradeError;
use tracing::{info, warn};

use crate::fs_utils::{atomic_write, remove_file_if_exists};

/// Contents of the host lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    #[serde(default)]
    pub run_id: Option<String>,
    pub acquired_at_unix: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held(LockOwner),
    /// The owning process is gone; the next acquire reclaims it.
    Stale(LockOwner),
    /// The lock file exists but cannot be parsed.
    Corrupt,
    /// The lock file is empty. Never reclaimed automatically.
    Empty,
}

static CLAIM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Advisory per-host lock. Released when dropped.
#[derive(Debug)]
pub struct HostLock {
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

impl HostLock {
    /// Claims the lock at `path`, reclaiming it first when `alive` reports the
    /// recorded owner is gone.
    pub fn acquire(
        path: &Path,
        owner: LockOwner,
        alive: &dyn Fn(u32) -> bool,
    ) -> Result<HostLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        for _ in 0..2 {
            match try_create(path, &owner) {
                Ok(()) => {
                    info!(pid = owner.pid, path = %path.display(), "host lock acquired");
                    return Ok(HostLock {
                        path: path.to_path_buf(),
                        owner,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to claim host lock: {}", path.display())
                    });
                }
            }

            let Some(raw) = read_lock(path)? else {
                continue;
            };
            match classify(&raw, alive) {
                LockStatus::Held(existing) => {
                    return Err(UpgradeError::ConcurrentRunDetected {
                        run_id: existing.run_id.unwrap_or_else(|| "unknown".to_string()),
                        owner_pid: existing.pid,
                    }
                    .into());
                }
                LockStatus::Empty => {
                    return Err(UpgradeError::ConcurrentRunDetected {
                        run_id: "unknown".to_string(),
                        owner_pid: 0,
                    })
                    .with_context(|| {
                        format!(
                            "host lock {} is empty; remove it if no stackward process is running",
                            path.display()
                        )
                    });
                }
                LockStatus::Stale(existing) => {
                    warn!(
                        stale_pid = existing.pid,
                        run_id = existing.run_id.as_deref().unwrap_or("-"),
                        "reclaiming stale host lock"
                    );
                    reclaim(path, &raw)?;
                }
                LockStatus::Corrupt => {
                    warn!(path = %path.display(), "reclaiming unreadable host lock");
                    reclaim(path, &raw)?;
                }
                LockStatus::Free => {}
            }
        }

        Err(anyhow!(
            "host lock {} was claimed by another process during reclaim",
            path.display()
        ))
    }

    pub fn inspect(path: &Path, alive: &dyn Fn(u32) -> bool) -> Result<LockStatus> {
        Ok(match read_lock(path)? {
            Some(raw) => classify(&raw, alive),
            None => LockStatus::Free,
        })
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Records the run now holding the lock.
    pub fn set_run_id(&mut self, run_id: &str) -> Result<()> {
        self.owner.run_id = Some(run_id.to_string());
        let encoded = serde_json::to_vec(&self.owner).context("failed to encode lock owner")?;
        atomic_write(&self.path, &encoded)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_file_if_exists(&self.path)
            .with_context(|| format!("failed to release host lock: {}", self.path.display()))
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = remove_file_if_exists(&self.path);
        }
    }
}

fn read_lock(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to read host lock: {}", path.display()))
        }
    }
}

fn classify(raw: &str, alive: &dyn Fn(u32) -> bool) -> LockStatus {
    if raw.trim().is_empty() {
        return LockStatus::Empty;
    }
    match serde_json::from_str::<LockOwner>(raw) {
        Ok(owner) if alive(owner.pid) => LockStatus::Held(owner),
        Ok(owner) => LockStatus::Stale(owner),
        Err(_) => LockStatus::Corrupt,
    }
}

/// The lock only ever appears with its owner already written: the owner goes
/// to a private file that is then hard-linked into place.
fn try_create(path: &Path, owner: &LockOwner) -> io::Result<()> {
    let claim = private_sibling(path, "claim")?;
    let written = write_claim(&claim, owner).and_then(|()| fs::hard_link(&claim, path));
    let _ = fs::remove_file(&claim);
    written
}

fn write_claim(claim: &Path, owner: &LockOwner) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(claim)?;
    let encoded = serde_json::to_vec(owner).map_err(io::Error::other)?;
    file.write_all(&encoded)?;
    file.sync_all()
}

/// Moves the lock aside and deletes it only when it still reads `expected`.
/// A lock that changed hands since it was inspected is linked back.
pub(crate) fn reclaim(path: &Path, expected: &str) -> Result<()> {
    let aside = private_sibling(path, "reclaim")
        .with_context(|| format!("failed to name reclaim file for {}", path.display()))?;
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to move aside host lock: {}", path.display()));
        }
    }

    let current = fs::read_to_string(&aside);
    if current.as_deref().ok() != Some(expected) {
        warn!(path = %path.display(), "host lock changed hands during reclaim; restoring it");
        if let Err(err) = fs::hard_link(&aside, path) {
            if err.kind() != io::ErrorKind::AlreadyExists {
                warn!(path = %path.display(), error = %err, "failed to restore host lock");
            }
        }
    }
    remove_file_if_exists(&aside)
        .with_context(|| format!("failed to remove reclaimed lock: {}", aside.display()))
}

fn private_sibling(path: &Path, purpose: &str) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::other(format!("{} has no file name", path.display())))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seq = CLAIM_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(path.with_file_name(format!(
        ".{name}.{}.{nanos}.{seq}.{purpose}",
        std::process::id()
    )))
}

/// Liveness probe for a lock owner.
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(true)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}
