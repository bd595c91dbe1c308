use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::{DistributedLock, DistributedLockService, LockError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// A [`DistributedLockService`] using advisory exclusive locks on files in a shared directory.
///
/// Each lock name maps to a percent-encoded `.lock` file in the lock directory.
/// All processes coordinating on the same store must use the same lock directory, for example on a shared filesystem that supports `flock`.
#[derive(Debug, Clone)]
pub struct FileLockService {
    directory: PathBuf,
}

impl FileLockService {
    /// Create a file lock service with lock files in `directory`, creating the directory if it does not exist.
    ///
    /// # Errors
    /// Returns an [`std::io::Error`] if the directory cannot be created.
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory)?;
        Ok(Self { directory })
    }

    /// The lock directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.directory
            .join(format!("{}.lock", urlencoding::encode(name)))
    }
}

#[derive(Debug)]
struct FileLock {
    file: File,
    path: PathBuf,
}

impl DistributedLock for FileLock {}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            log::warn!("failed to release lock file {}: {err}", self.path.display());
        }
    }
}

impl DistributedLockService for FileLockService {
    fn acquire(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLock>, LockError> {
        let unavailable = |err: std::io::Error| LockError::Unavailable {
            name: name.to_string(),
            reason: err.to_string(),
        };
        let path = self.lock_path(name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(unavailable)?;

        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Box::new(FileLock { file, path })),
                Err(err)
                    if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {}
                Err(err) => return Err(unavailable(err)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
