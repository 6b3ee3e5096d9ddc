//! Cross-process lock file for a storage directory.
//!
//! The lock is a file created exclusively and holding the owner's decimal
//! process id. A lock whose owner is no longer running is stale and may be
//! broken. There is no heartbeat; liveness is judged from the process table.

use ccnidx_common::{CcnxError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Name of the lock file inside a storage directory.
pub const LOCK_FILE_NAME: &str = ".LCK";

/// Pause before retrying a lock whose owner has not been recorded yet.
const UNRECORDED_OWNER_DELAY: Duration = Duration::from_millis(20);

/// Returns true if a process with this id is running.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match sys.process(pid) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Reads the owner pid of a lock file.
///
/// `Ok(None)` means the file is gone; `Ok(Some(None))` means it exists but
/// holds no pid yet.
fn read_owner(path: &Path) -> Result<Option<Option<u32>>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text.trim().parse::<u32>().ok())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Removes a lock left by the dead process `owner`.
///
/// The lock is first renamed aside and its owner read again from the
/// renamed file, so a lock created by another process in the meantime is
/// never deleted; such a lock is linked back in place. Returns false if the
/// lock was not removed.
fn break_stale(path: &Path, owner: u32) -> Result<bool> {
    let aside = path.with_file_name(format!(
        "{}.{}.stale",
        LOCK_FILE_NAME,
        std::process::id()
    ));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    if read_owner(&aside)? == Some(Some(owner)) {
        fs::remove_file(&aside)?;
        return Ok(true);
    }
    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            tracing::warn!(path = %path.display(), "lock replaced while breaking a stale lock");
        }
        Err(e) => return Err(e.into()),
    }
    fs::remove_file(&aside)?;
    Ok(false)
}

/// An acquired lock file.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    pid: u32,
    held: bool,
}

impl LockFile {
    /// Acquires the lock in `dir`, breaking a stale lock if necessary.
    ///
    /// Fails with `LockHeld` if a live process owns the lock, and with
    /// `LockUnavailable` if the lock could not be created within `attempts`
    /// tries. A lock file without a readable pid belongs to a process that
    /// is still writing it and is never broken.
    pub fn acquire(dir: &Path, attempts: u32) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let pid = std::process::id();
        for attempt in 1..=attempts {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(pid.to_string().as_bytes())?;
                    file.sync_all()?;
                    tracing::debug!(path = %path.display(), pid, attempt, "lock acquired");
                    return Ok(Self {
                        path,
                        pid,
                        held: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match read_owner(&path)? {
                // Released between our create and read
                None => continue,
                Some(None) => {
                    tracing::debug!(path = %path.display(), attempt, "lock owner not recorded yet");
                    thread::sleep(UNRECORDED_OWNER_DELAY);
                }
                Some(Some(owner)) if process_alive(owner) => {
                    return Err(CcnxError::LockHeld { pid: owner, path });
                }
                Some(Some(owner)) => {
                    let broken = break_stale(&path, owner)?;
                    tracing::debug!(path = %path.display(), owner, attempt, broken, "stale lock");
                }
            }
        }
        Err(CcnxError::LockUnavailable { path, attempts })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Process id recorded in the lock.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Removes the lock file. Releasing twice is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.held = false;
        tracing::debug!(path = %self.path.display(), "lock released");
        Ok(())
    }
}
