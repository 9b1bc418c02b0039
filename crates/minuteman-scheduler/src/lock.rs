//! Advisory per-job file locks.
//!
//! A lock file holds the PID of its current holder and is truncated, never
//! deleted, on release. Whether a lock is *held* is decided only by a
//! non-blocking exclusive OS lock: `flock(LOCK_EX | LOCK_NB)` on Unix,
//! [`File::try_lock`] elsewhere. The recorded PID and the file's mtime exist
//! so that a later scan can measure how long the previous holder has been
//! running (see [`LockManager::lock_age`]).

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::debug;

use crate::error::LockError;

/// Non-blocking attempts before a lock is reported busy.
pub const LOCK_ATTEMPTS: u32 = 5;
/// Pause between two attempts.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Owns the lock handles acquired by one executor.
///
/// Each executor holds its own manager; there is no process-wide table.
/// Dropping the manager closes the handles, which releases the OS locks.
#[derive(Debug)]
pub struct LockManager {
    handles: HashMap<PathBuf, File>,
    attempts: u32,
    retry_delay: Duration,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_retry(LOCK_ATTEMPTS, LOCK_RETRY_DELAY)
    }

    pub fn with_retry(attempts: u32, retry_delay: Duration) -> Self {
        Self {
            handles: HashMap::new(),
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// Whether this instance currently holds `path`.
    pub fn holds(&self, path: &Path) -> bool {
        self.handles.contains_key(path)
    }

    /// Acquire the exclusive lock on `path`, creating the file if needed.
    ///
    /// On success the file is truncated and the current PID written to it.
    ///
    /// # Errors
    ///
    /// - `Logic`: this instance already holds `path`.
    /// - `Busy`: another holder kept the lock through every attempt.
    /// - `Io`: the file could not be created, opened or written.
    pub async fn acquire(&mut self, path: &Path) -> Result<(), LockError> {
        if self.holds(path) {
            return Err(LockError::Logic(format!(
                "Lock already acquired (lockfile: {}).",
                path.display()
            )));
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LockError::io(path, e))?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| LockError::io(path, e))?;

        for attempt in 1..=self.attempts {
            if try_lock_exclusive(&file).map_err(|e| LockError::io(path, e))? {
                write_pid(&mut file).map_err(|e| LockError::io(path, e))?;
                debug!(path = %path.display(), attempt, "lock acquired");
                self.handles.insert(path.to_path_buf(), file);
                return Ok(());
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(LockError::Busy {
            path: path.to_path_buf(),
        })
    }

    /// Truncate and unlock `path`.
    ///
    /// # Errors
    ///
    /// - `Logic`: this instance does not hold `path`.
    pub fn release(&mut self, path: &Path) -> Result<(), LockError> {
        let file = self.handles.remove(path).ok_or_else(|| {
            LockError::Logic(format!("Lock NOT held - bug? Lockfile: {}", path.display()))
        })?;

        file.set_len(0).map_err(|e| LockError::io(path, e))?;
        unlock(&file).map_err(|e| LockError::io(path, e))?;
        debug!(path = %path.display(), "lock released");
        Ok(())
    }

    /// Seconds since the lock file was last written by a live holder.
    ///
    /// Returns 0 when the file is missing or empty, or when its holder is
    /// gone (stale lock).
    pub fn lock_age(path: &Path) -> Result<u64, LockError> {
        if !has_live_holder(path)? {
            return Ok(0);
        }

        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(LockError::io(path, e)),
        };

        Ok(SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default()
            .as_secs())
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a file-name-safe lock identity from a job name.
///
/// Lowercases ASCII letters, drops everything outside `[a-z0-9_. -]`, trims, turns spaces
/// into underscores and collapses underscore runs.
pub fn sanitize_name(name: &str) -> String {
    let kept: String = name
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | ' ' | '-'))
        .collect();

    let mut out = String::with_capacity(kept.len());
    for c in kept.trim().chars() {
        let c = if c == ' ' { '_' } else { c };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

// ---------------------------------------------------------------------------
// Platform helpers
// ---------------------------------------------------------------------------

/// Whether the lock file at `path` belongs to a holder that still runs.
///
/// On Unix the recorded PID is checked with `kill(pid, 0)`.
#[cfg(unix)]
fn has_live_holder(path: &Path) -> Result<bool, LockError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(LockError::io(path, e)),
    };
    Ok(content
        .trim()
        .parse::<u32>()
        .is_ok_and(is_pid_alive))
}

/// Whether the lock file at `path` belongs to a holder that still runs.
///
/// Without a portable PID check the OS lock itself is the witness: a holder
/// that exited no longer has it, so a successful `try_lock` means stale.
/// The content stays unread because a held lock also blocks reads here.
#[cfg(not(unix))]
fn has_live_holder(path: &Path) -> Result<bool, LockError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(LockError::io(path, e)),
    };
    if file.metadata().map_err(|e| LockError::io(path, e))?.len() == 0 {
        return Ok(false);
    }
    if try_lock_exclusive(&file).map_err(|e| LockError::io(path, e))? {
        unlock(&file).map_err(|e| LockError::io(path, e))?;
        return Ok(false);
    }
    Ok(true)
}

/// Check whether a given PID is alive via `kill(pid, 0)`.
#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Try to take an exclusive lock without blocking.
///
/// Returns `Ok(false)` when another open file handle holds it.
fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and valid for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        match file.try_lock() {
            Ok(()) => Ok(true),
            Err(fs::TryLockError::WouldBlock) => Ok(false),
            Err(fs::TryLockError::Error(e)) => Err(e),
        }
    }
}

fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and valid for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        file.unlock()
    }
}
