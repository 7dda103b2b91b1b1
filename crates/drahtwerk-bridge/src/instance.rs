// SPDX-License-Identifier: MIT
//
// Single-instance guard.
//
// Two bridge processes fighting over the same serial devices and listener
// port corrupt both, so the app takes an exclusive advisory lock on a
// well-known file before doing anything else. The lock is released by the
// OS when the process exits, however it exits.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::info;

use drahtwerk_core::APP_ID;
use drahtwerk_core::error::{DrahtwerkError, Result};

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

/// Held exclusive lock. Dropping it releases the lock.
pub struct InstanceLock {
    path: PathBuf,
    #[cfg(unix)]
    _flock: Flock<std::fs::File>,
}

impl InstanceLock {
    /// Acquire the process-wide lock at the default location under the
    /// system temp directory. Fails fast when another instance holds it.
    pub fn acquire() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{APP_ID}.lock"));
        Self::acquire_at(&path)
    }

    /// Acquire the lock at an explicit path.
    #[cfg(unix)]
    pub fn acquire_at(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        let flock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            DrahtwerkError::AlreadyRunning(format!(
                "another instance holds {} ({errno})",
                path.display()
            ))
        })?;
        info!(path = %path.display(), "instance lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            _flock: flock,
        })
    }

    /// Non-unix platforms have no advisory lock here; the open itself is
    /// the only guard we apply.
    #[cfg(not(unix))]
    pub fn acquire_at(path: &Path) -> Result<Self> {
        let _ = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        tracing::warn!(
            path = %path.display(),
            "advisory locking unavailable on this platform, duplicate instances are not detected"
        );
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
