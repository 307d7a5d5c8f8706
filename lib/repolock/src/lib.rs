/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This software may be used and distributed according to the terms of the
 * GNU General Public License version 2.
 */

//! Repository locks.
//!
//! Two advisory file locks coordinate processes: the **store lock**
//! (changelog, manifests, filelogs, obsstore, phases) and the
//! **working-copy lock** (dirstate, merge state). A lock is a file
//! created with `O_EXCL` whose content is the owner's `host:pid`.
//!
//! Acquisition retries with exponential backoff up to a configured
//! timeout; the error after the timeout names the current holder. A
//! lock owned by a dead process on this host is stale and is broken
//! once the timeout expires.

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use configmodel::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {name} is held by {holder}")]
    Held { name: String, holder: String },

    #[error(transparent)]
    Config(#[from] configmodel::ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Acquisition tuning, from `lock.timeout` (seconds) and
/// `lock.backoff-start` (milliseconds).
#[derive(Debug, Clone)]
pub struct LockOptions {
    pub timeout: Duration,
    pub backoff_start: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            timeout: Duration::from_secs(600),
            backoff_start: Duration::from_millis(50),
        }
    }
}

impl LockOptions {
    pub fn from_config(config: &impl Config) -> Result<Self, LockError> {
        let defaults = LockOptions::default();
        Ok(LockOptions {
            timeout: Duration::from_secs(
                config.get_or("lock", "timeout", defaults.timeout.as_secs())?,
            ),
            backoff_start: Duration::from_millis(config.get_or(
                "lock",
                "backoff-start",
                defaults.backoff_start.as_millis() as u64,
            )?),
        })
    }
}

/// A held lock; released (file removed) on drop.
#[must_use = "the lock is released when the handle drops"]
pub struct LockHandle {
    path: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(err) = util::file::unlink_opt(&self.path) {
            tracing::warn!(lock = %self.path.display(), %err, "failed to release lock");
        }
    }
}

/// One attempt, no waiting. `Ok(None)` means somebody holds it.
fn try_acquire(path: &Path) -> Result<Option<LockHandle>, LockError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(util::sys::lock_identity().as_bytes())?;
            file.sync_all()?;
            Ok(Some(LockHandle {
                path: path.to_path_buf(),
            }))
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// The `host:pid` currently in the lock file, if readable.
fn read_holder(path: &Path) -> Option<String> {
    let data = util::file::read_opt(path).ok()??;
    String::from_utf8(data).ok()
}

/// A holder on this host whose pid is gone is stale.
fn holder_is_stale(holder: &str) -> bool {
    let (host, pid) = match holder.rsplit_once(':') {
        Some(split) => split,
        None => return false,
    };
    if host != util::sys::hostname() {
        return false;
    }
    match pid.parse::<u32>() {
        Ok(pid) => !util::sys::process_alive(pid),
        Err(_) => false,
    }
}

/// Acquire the lock file at `path`, waiting up to the configured
/// timeout with exponential backoff.
pub fn acquire(path: &Path, options: &LockOptions) -> Result<LockHandle, LockError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let deadline = Instant::now() + options.timeout;
    let mut backoff = options.backoff_start;
    loop {
        if let Some(handle) = try_acquire(path)? {
            tracing::debug!(lock = %path.display(), "lock acquired");
            return Ok(handle);
        }
        let holder = read_holder(path).unwrap_or_else(|| "unknown".to_string());
        if Instant::now() >= deadline {
            if holder_is_stale(&holder) {
                tracing::warn!(lock = %path.display(), holder, "breaking stale lock");
                util::file::unlink_opt(path)?;
                if let Some(handle) = try_acquire(path)? {
                    return Ok(handle);
                }
            }
            return Err(LockError::Held { name, holder });
        }
        tracing::debug!(lock = %path.display(), holder, "waiting for lock");
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(Duration::from_secs(1));
    }
}

/// The repository's two locks.
pub struct RepoLocker {
    store_lock_path: PathBuf,
    wlock_path: PathBuf,
    options: LockOptions,
}

impl RepoLocker {
    /// `dot_dir` is the repository metadata directory (`.hg`). The
    /// store lock lives beside the store so that shared-store setups
    /// contend on the right file.
    pub fn new(dot_dir: &Path, options: LockOptions) -> Self {
        RepoLocker {
            store_lock_path: dot_dir.join("store").join("lock"),
            wlock_path: dot_dir.join("wlock"),
            options,
        }
    }

    /// The store lock: required for any write to revlogs, obsstore,
    /// phases or bookmarks.
    pub fn lock_store(&self) -> Result<LockHandle, LockError> {
        acquire(&self.store_lock_path, &self.options)
    }

    /// The working-copy lock: required for dirstate and merge state.
    pub fn lock_working_copy(&self) -> Result<LockHandle, LockError> {
        acquire(&self.wlock_path, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(150),
            backoff_start: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        {
            let _handle = acquire(&path, &fast_options()).unwrap();
            assert!(path.exists());
            let holder = read_holder(&path).unwrap();
            assert!(holder.ends_with(&format!(":{}", std::process::id())));
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_contention_reports_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _held = acquire(&path, &fast_options()).unwrap();
        match acquire(&path, &fast_options()) {
            Err(LockError::Held { holder, .. }) => {
                assert_eq!(holder, util::sys::lock_identity());
            }
            other => panic!("expected Held, got {:?}", other.map(|_| ())),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_lock_broken_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        // A pid that cannot be alive (pid_max is far below this).
        std::fs::write(
            &path,
            format!("{}:4000000000", util::sys::hostname()),
        )
        .unwrap();
        let handle = acquire(&path, &fast_options()).unwrap();
        drop(handle);
        assert!(!path.exists());
    }

    #[test]
    fn test_foreign_host_lock_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        std::fs::write(&path, "otherhost:1").unwrap();
        assert!(matches!(
            acquire(&path, &fast_options()),
            Err(LockError::Held { .. })
        ));
        assert!(path.exists());
    }

    #[test]
    fn test_exactly_one_of_concurrent_acquirers_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let path = path.clone();
                    scope.spawn(move || try_acquire(&path).unwrap().is_some())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results.iter().filter(|&&won| won).count(), 1);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = configmodel::ConfigSet::new();
        config.set("lock", "timeout", "3");
        let options = LockOptions::from_config(&config).unwrap();
        assert_eq!(options.timeout, Duration::from_secs(3));
        config.set("lock", "timeout", "never");
        assert!(LockOptions::from_config(&config).is_err());
    }
}
