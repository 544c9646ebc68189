// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Host-wide mutual exclusion around domain bring-up.
//!
//! Creating a domain races with the platform's free-memory reclamation, so
//! every bring-up takes an exclusive advisory lock on a well-known path
//! and releases it as soon as the platform has accepted the creation
//! request. The lock never spans the event-wait loop.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use slog::{o, warn};

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "lock"))
    };
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Same-session re-acquisition; guards against accidental
    /// double-invocation, not against other processes.
    #[error("creation lock already held by this session")]
    AlreadyLocked,

    #[error("creation lock not held")]
    NotLocked,

    #[error("cannot open lock file {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot acquire lock {path}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
}

/// One session's handle on the bring-up lock.
///
/// Acquisition blocks until granted, retrying transparently on signal
/// interruption; there is no timeout or backoff.
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

impl InstanceLock {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        InstanceLock {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    pub fn acquire(&mut self) -> Result<(), LockError> {
        if self.file.is_some() {
            return Err(LockError::AlreadyLocked);
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o200)
            .custom_flags(libc::O_CLOEXEC)
            .open(&self.path)
            .map_err(|source| LockError::Open {
                path: self.path.clone(),
                source,
            })?;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(LockError::Acquire {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        }

        self.file = Some(file);
        Ok(())
    }

    pub fn release(&mut self) -> Result<(), LockError> {
        let file = self.file.take().ok_or(LockError::NotLocked)?;

        if let Err(e) = flock(file.as_raw_fd(), FlockArg::Unlock) {
            // Closing the descriptor releases the lock anyway.
            warn!(sl!(), "cannot unlock {}: {}", self.path.display(), e);
        }

        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if self.file.is_some() {
            let _ = self.release();
        }
    }
}
