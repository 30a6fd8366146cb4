//! Directory-based mutual exclusion over the shared state document.
//!
//! Acquisition creates the lock directory exclusively and records the owner
//! in `lock_info.json`. Every process that touches the document uses the same
//! directory, regardless of language runtime, so no OS advisory locks are
//! involved.
//!
//! Before each attempt an existing lock is checked for staleness:
//! - owner info unreadable and the directory older than the stale threshold
//! - owner pid no longer running on this host (a record without a host is local)
//! - owner timestamp older than the stale threshold
//!
//! Any of these removes the directory and the attempt proceeds.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::LockConfig;
use crate::errors::LockError;

/// File inside the lock directory describing the owner.
pub const LOCK_INFO_FILENAME: &str = "lock_info.json";

/// Lock directories held by this process.
static HELD: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

static HOSTNAME: LazyLock<String> = LazyLock::new(local_hostname);

/// Owner record. Diagnostic only; correctness relies on directory creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(deserialize_with = "whole_pid")]
    pub pid: u32,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// Empty when the writer did not record one
    #[serde(default)]
    pub host: String,
}

/// Some writers emit the pid as a float; accept it when it is a whole number.
fn whole_pid<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let raw = f64::deserialize(deserializer)?;
    if raw.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&raw) {
        Ok(raw as u32)
    } else {
        Err(D::Error::custom(format!("pid must be a whole number, got {raw}")))
    }
}

impl LockInfo {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            timestamp: unix_now(),
            host: HOSTNAME.clone(),
        }
    }

    fn is_local(&self) -> bool {
        self.host.is_empty() || self.host == *HOSTNAME
    }

    fn age(&self) -> Duration {
        Duration::try_from_secs_f64((unix_now() - self.timestamp).max(0.0)).unwrap_or_default()
    }
}

/// Mutex over a state file, keyed by its canonical path.
#[derive(Debug, Clone)]
pub struct StateLock {
    lock_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    stale_after: Duration,
}

impl StateLock {
    /// Create the lock guarding `state_path`.
    ///
    /// `sessions-state.json` is guarded by `sessions-state.lock`; any other
    /// file by `<name>.lock` next to it. The parent directory is created if
    /// missing.
    pub fn new(state_path: &Path, settings: &LockConfig) -> Result<Self, LockError> {
        let parent = match state_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|source| LockError::Io {
            path: parent.clone(),
            source,
        })?;
        let parent = parent.canonicalize().map_err(|source| LockError::Io {
            path: parent.clone(),
            source,
        })?;

        let name = state_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let lock_name = match name.strip_suffix(".json") {
            Some(stem) if stem == "sessions-state" => format!("{stem}.lock"),
            _ => format!("{name}.lock"),
        };

        Ok(Self {
            lock_dir: parent.join(lock_name),
            timeout: settings.timeout(),
            poll_interval: settings.poll_interval(),
            stale_after: settings.stale_timeout(),
        })
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Acquire the lock, polling until the timeout elapses.
    pub fn acquire(&self) -> Result<StateLockGuard, LockError> {
        self.check_reentry()?;
        let started = Instant::now();
        loop {
            if let Some(guard) = self.attempt()? {
                tracing::debug!(
                    lock = %self.lock_dir.display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Acquired state lock"
                );
                return Ok(guard);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                tracing::warn!(
                    lock = %self.lock_dir.display(),
                    owner = ?read_info(&self.lock_dir).ok().flatten(),
                    "Timed out waiting for state lock"
                );
                return Err(LockError::Timeout {
                    path: self.lock_dir.clone(),
                    waited: elapsed,
                });
            }
            std::thread::sleep(self.poll_interval.min(self.timeout - elapsed));
        }
    }

    /// Make a single acquisition attempt.
    pub fn try_acquire(&self) -> Result<Option<StateLockGuard>, LockError> {
        self.check_reentry()?;
        self.attempt()
    }

    fn check_reentry(&self) -> Result<(), LockError> {
        let held = HELD.lock().unwrap_or_else(|e| e.into_inner());
        if held.contains(&self.lock_dir) {
            return Err(LockError::Reentrant {
                path: self.lock_dir.clone(),
            });
        }
        Ok(())
    }

    fn attempt(&self) -> Result<Option<StateLockGuard>, LockError> {
        self.clear_if_stale();

        match std::fs::create_dir(&self.lock_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
            Err(source) => {
                return Err(LockError::Io {
                    path: self.lock_dir.clone(),
                    source,
                });
            }
        }

        if let Err(source) = write_info(&self.lock_dir, &LockInfo::current()) {
            let _ = std::fs::remove_dir_all(&self.lock_dir);
            return Err(LockError::Io {
                path: self.lock_dir.join(LOCK_INFO_FILENAME),
                source,
            });
        }

        HELD.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.lock_dir.clone());
        Ok(Some(StateLockGuard {
            lock_dir: self.lock_dir.clone(),
            released: false,
        }))
    }

    /// Remove the lock directory if its owner is gone or it has gone stale.
    fn clear_if_stale(&self) {
        let reason = match read_info(&self.lock_dir) {
            Ok(None) => return,
            Ok(Some(info)) => {
                if info.is_local() && !pid_alive(info.pid) {
                    Some("owner process is not running")
                } else if info.age() > self.stale_after {
                    Some("owner timestamp expired")
                } else {
                    None
                }
            }
            Err(_) => match dir_age(&self.lock_dir) {
                Some(age) if age > self.stale_after => Some("owner info unreadable and lock expired"),
                _ => None,
            },
        };

        if let Some(reason) = reason {
            tracing::warn!(lock = %self.lock_dir.display(), reason, "Removing stale state lock");
            if let Err(e) = remove_lock_dir(&self.lock_dir) {
                tracing::warn!(lock = %self.lock_dir.display(), error = %e, "Failed to remove stale lock");
            }
        }
    }
}

/// Proof of lock ownership. Releases the lock on drop.
#[derive(Debug)]
pub struct StateLockGuard {
    lock_dir: PathBuf,
    released: bool,
}

impl StateLockGuard {
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Release the lock. Releasing twice, or after the directory vanished, is a no-op.
    pub fn release(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        HELD.lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.lock_dir);
        remove_lock_dir(&self.lock_dir).map_err(|source| LockError::Io {
            path: self.lock_dir.clone(),
            source,
        })?;
        tracing::debug!(lock = %self.lock_dir.display(), "Released state lock");
        Ok(())
    }
}

impl Drop for StateLockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "Failed to release state lock");
        }
    }
}

/// Read the owner record. `Ok(None)` when the lock directory does not exist.
pub fn read_info(lock_dir: &Path) -> std::io::Result<Option<LockInfo>> {
    if !lock_dir.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(lock_dir.join(LOCK_INFO_FILENAME))?;
    let info: LockInfo = serde_json::from_slice(&raw)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    if info.pid == 0 || i32::try_from(info.pid).is_err() || !info.timestamp.is_finite() {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            "lock info has an invalid pid or timestamp",
        ));
    }
    Ok(Some(info))
}

fn write_info(lock_dir: &Path, info: &LockInfo) -> std::io::Result<()> {
    let raw = serde_json::to_vec(info).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    std::fs::write(lock_dir.join(LOCK_INFO_FILENAME), raw)
}

fn remove_lock_dir(lock_dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(lock_dir) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn dir_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Check whether `pid` names a live process. Permission errors count as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs error checking only; no signal is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for `buf.len()` bytes; gethostname writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

#[cfg(not(unix))]
fn local_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}
