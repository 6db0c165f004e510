use std::{
    fs::{File, OpenOptions, Permissions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use rustix::fs::{FlockOperation, flock};
use tracing::{debug, warn};

/// Outcome of a zero-wait acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// We now hold the lock and the previous holder released it cleanly.
    Acquired,
    /// Another live process holds the lock.
    AlreadyHeld,
    /// We now hold the lock, but the previous holder died without releasing.
    AbandonedRecovered,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not create lock file {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("lock operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Two consecutive abandonments on the same lock object. The lock file is
    /// presumed damaged; retrying forever would just loop.
    #[error("lock {path} abandoned twice in a row, treating as corrupted")]
    Corrupted { path: PathBuf },
    #[error("release called without holding the lock")]
    NotHeld,
}

/// Host-wide mutual exclusion keyed by a derived resource name.
pub trait NamedLock {
    fn try_acquire(&mut self) -> Result<LockState, LockError>;
    fn release(&mut self) -> Result<(), LockError>;
}

/// [`NamedLock`] over an advisory whole-file lock.
///
/// The kernel drops an advisory lock when its holder exits, so mutual
/// exclusion itself can never dangle. Abandonment is detected through a PID
/// marker: the holder writes its PID after acquiring and truncates the file
/// on clean release. Acquiring a lock whose file still carries a marker means
/// the previous holder died mid-flight.
///
/// Dropping a `FileLock` without calling [`NamedLock::release`] deliberately
/// leaves the marker behind, which is indistinguishable from the holder dying
/// (that is the point: the next acquirer recovers it as abandoned).
pub struct FileLock {
    path: PathBuf,
    file: File,
    held: bool,
    recovered: bool,
}

impl FileLock {
    /// Open (creating if needed) the lock file. World-writable so every user
    /// on the host can contend for the same lock.
    pub fn new(path: &Path) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::Create {
                path: path.to_path_buf(),
                source,
            })?;

        // umask may have stripped bits at creation.
        if let Err(e) = std::fs::set_permissions(path, Permissions::from_mode(0o666)) {
            debug!(path = %path.display(), error = %e, "could not relax lock file mode");
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            held: false,
            recovered: false,
        })
    }

    fn io_err(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Read whatever PID marker the previous holder left behind. Only valid
    /// while we hold the flock, which serializes all marker access.
    fn residual_marker(&mut self) -> Result<Option<String>, LockError> {
        let mut contents = String::new();
        let read = (|| {
            self.file.seek(SeekFrom::Start(0))?;
            self.file.read_to_string(&mut contents)
        })();
        if let Err(e) = read {
            return Err(self.io_err(e));
        }
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }

    fn write_marker(&mut self) -> Result<(), LockError> {
        let pid = rustix::process::getpid().as_raw_nonzero().get();
        let wrote = (|| {
            self.file.set_len(0)?;
            self.file.seek(SeekFrom::Start(0))?;
            write!(self.file, "{pid}")?;
            self.file.flush()
        })();
        wrote.map_err(|e| self.io_err(e))
    }
}

impl NamedLock for FileLock {
    /// Zero-wait acquisition. Never blocks: a held lock reports
    /// [`LockState::AlreadyHeld`] immediately.
    fn try_acquire(&mut self) -> Result<LockState, LockError> {
        if self.held {
            return Ok(LockState::Acquired);
        }

        match flock(&self.file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(rustix::io::Errno::WOULDBLOCK) => return Ok(LockState::AlreadyHeld),
            Err(errno) => return Err(self.io_err(errno.into())),
        }
        self.held = true;

        let residual = self.residual_marker()?;
        match residual {
            None => {
                self.recovered = false;
                self.write_marker()?;
                Ok(LockState::Acquired)
            }
            Some(stale_pid) if !self.recovered => {
                warn!(
                    path = %self.path.display(),
                    stale_pid,
                    "previous holder died without releasing, recovering lock"
                );
                self.recovered = true;
                self.write_marker()?;
                Ok(LockState::AbandonedRecovered)
            }
            Some(stale_pid) => {
                // Second abandonment in a row on this object: something keeps
                // dying while holding, or the file is being tampered with.
                warn!(path = %self.path.display(), stale_pid, "repeated lock abandonment");
                let _ = flock(&self.file, FlockOperation::Unlock);
                self.held = false;
                Err(LockError::Corrupted {
                    path: self.path.clone(),
                })
            }
        }
    }

    fn release(&mut self) -> Result<(), LockError> {
        if !self.held {
            return Err(LockError::NotHeld);
        }
        // Truncate the marker while still holding, so a clean release can
        // never be mistaken for abandonment.
        self.file.set_len(0).map_err(|e| self.io_err(e))?;
        flock(&self.file, FlockOperation::Unlock).map_err(|e| self.io_err(e.into()))?;
        self.held = false;
        debug!(path = %self.path.display(), "lock released");
        Ok(())
    }
}
