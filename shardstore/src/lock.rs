//! Container lock coordination.
//!
//! A [`LockCoordinator`] grants mutual exclusion on a container path for the duration of one write or one consolidation claim.
//! The returned [`ContainerLock`] releases the lock when dropped.
//!
//! Lock modes:
//! - [`LockMode::Disabled`]: locks are no-ops and a single writer process is assumed.
//! - [`LockMode::Local`]: locks exclude threads of this process sharing the coordinator.
//! - [`LockMode::Distributed`]: locks are delegated to a [`DistributedLockService`], such as the [`FileLockService`], and exclude other processes and hosts.

mod file_lock_service;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use serde::{Deserialize, Serialize};
use shardstore_storage::StorageError;
use thiserror::Error;

pub use file_lock_service::FileLockService;

/// The default lock acquisition timeout.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// A lock error.
#[derive(Debug, Clone, Error)]
pub enum LockError {
    /// The lock was not acquired before the timeout elapsed.
    #[error("timed out after {timeout:?} acquiring lock {name}")]
    Timeout {
        /// The lock name.
        name: String,
        /// The timeout.
        timeout: Duration,
    },
    /// The lock service failed.
    #[error("lock service unavailable for lock {name}: {reason}")]
    Unavailable {
        /// The lock name.
        name: String,
        /// The service failure.
        reason: String,
    },
}

impl From<LockError> for StorageError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { name, .. } => Self::LockTimeout(name),
            LockError::Unavailable { name, reason } => Self::LockUnavailable(name, reason),
        }
    }
}

/// A lock held through a [`DistributedLockService`].
///
/// The lock is released when dropped.
pub trait DistributedLock: Send + std::fmt::Debug {}

/// A cross-process mutual exclusion service.
pub trait DistributedLockService: Send + Sync + std::fmt::Debug {
    /// Acquire the lock `name`, blocking for at most `timeout`.
    ///
    /// # Errors
    /// Returns [`LockError::Timeout`] if the lock is held elsewhere for longer than `timeout`, or [`LockError::Unavailable`] if the service fails.
    fn acquire(&self, name: &str, timeout: Duration)
        -> Result<Box<dyn DistributedLock>, LockError>;
}

/// The lock mode of a [`LockCoordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// No locking.
    #[default]
    Disabled,
    /// In-process locking.
    Local,
    /// Cross-process locking through a [`DistributedLockService`].
    Distributed,
}

type LocalLocks = Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>;

#[derive(Debug)]
enum LockCoordinatorMode {
    Disabled,
    Local(LocalLocks),
    Distributed(Arc<dyn DistributedLockService>),
}

/// Grants mutual exclusion on container paths.
///
/// A coordinator can be shared between store instances with an [`Arc`].
#[derive(Debug)]
pub struct LockCoordinator {
    mode: LockCoordinatorMode,
    timeout: Duration,
}

impl LockCoordinator {
    /// Create a coordinator that does not lock.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            mode: LockCoordinatorMode::Disabled,
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Create a coordinator with in-process locks.
    #[must_use]
    pub fn local() -> Self {
        Self {
            mode: LockCoordinatorMode::Local(Arc::default()),
            timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Create a coordinator delegating to a distributed lock `service`, waiting at most `timeout` for each lock.
    #[must_use]
    pub fn distributed(service: Arc<dyn DistributedLockService>, timeout: Duration) -> Self {
        Self {
            mode: LockCoordinatorMode::Distributed(service),
            timeout,
        }
    }

    /// Return the lock mode.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        match self.mode {
            LockCoordinatorMode::Disabled => LockMode::Disabled,
            LockCoordinatorMode::Local(_) => LockMode::Local,
            LockCoordinatorMode::Distributed(_) => LockMode::Distributed,
        }
    }

    /// Return the lock acquisition timeout of a distributed coordinator.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire the lock on the container at `container` (a path relative to the store root).
    ///
    /// Local locks block until acquired. Distributed locks block for at most [`LockCoordinator::timeout`].
    ///
    /// # Errors
    /// Returns a [`LockError`] if a distributed lock is not acquired.
    pub fn acquire(&self, container: &str) -> Result<ContainerLock, LockError> {
        let guard = match &self.mode {
            LockCoordinatorMode::Disabled => ContainerLockGuard::Disabled,
            LockCoordinatorMode::Local(locks) => {
                let mutex = locks.lock().entry(container.to_string()).or_default().clone();
                ContainerLockGuard::Local {
                    guard: Some(mutex.lock_arc()),
                    locks: locks.clone(),
                }
            }
            LockCoordinatorMode::Distributed(service) => {
                ContainerLockGuard::Distributed(service.acquire(container, self.timeout)?)
            }
        };
        if !matches!(guard, ContainerLockGuard::Disabled) {
            log::debug!("acquired lock on container {container}");
        }
        Ok(ContainerLock {
            container: container.to_string(),
            guard,
        })
    }
}

impl Default for LockCoordinator {
    fn default() -> Self {
        Self::disabled()
    }
}

enum ContainerLockGuard {
    Disabled,
    Local {
        guard: Option<ArcMutexGuard<RawMutex, ()>>,
        locks: LocalLocks,
    },
    Distributed(Box<dyn DistributedLock>),
}

impl std::fmt::Debug for ContainerLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Local { .. } => f.write_str("Local"),
            Self::Distributed(lock) => f.debug_tuple("Distributed").field(lock).finish(),
        }
    }
}

/// A held container lock, released when dropped.
#[derive(Debug)]
#[must_use = "the lock is released when dropped"]
pub struct ContainerLock {
    container: String,
    guard: ContainerLockGuard,
}

impl Drop for ContainerLock {
    fn drop(&mut self) {
        if let ContainerLockGuard::Local { guard, locks } = &mut self.guard {
            drop(guard.take());
            // Remove the entry unless another thread holds or awaits the lock
            let mut locks = locks.lock();
            if locks
                .get(&self.container)
                .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
            {
                locks.remove(&self.container);
            }
        }
    }
}

impl ContainerLock {
    /// The container path of the lock.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn lock_disabled() {
        let locks = LockCoordinator::disabled();
        assert_eq!(locks.mode(), LockMode::Disabled);
        let first = locks.acquire("0.shard").unwrap();
        let second = locks.acquire("0.shard").unwrap();
        assert_eq!(first.container(), second.container());
    }

    #[test]
    fn lock_local_excludes_threads() {
        let locks = Arc::new(LockCoordinator::local());
        let holders = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let holders = holders.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let _lock = locks.acquire("a/0.shard").unwrap();
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        holders.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn lock_local_independent_containers() {
        let locks = LockCoordinator::local();
        let _first = locks.acquire("0.shard").unwrap();
        let _second = locks.acquire("1.shard").unwrap();
    }

    fn local_entries(locks: &LockCoordinator) -> usize {
        match &locks.mode {
            LockCoordinatorMode::Local(locks) => locks.lock().len(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn lock_local_released_entries_are_pruned() {
        let locks = LockCoordinator::local();
        let first = locks.acquire("0.shard").unwrap();
        let second = locks.acquire("1.shard").unwrap();
        assert_eq!(local_entries(&locks), 2);
        drop(first);
        assert_eq!(local_entries(&locks), 1);
        drop(second);
        assert_eq!(local_entries(&locks), 0);

        // A waiting thread still acquires the lock after it is released
        let locks = Arc::new(locks);
        let held = locks.acquire("0.shard").unwrap();
        let waiter = {
            let locks = locks.clone();
            std::thread::spawn(move || drop(locks.acquire("0.shard").unwrap()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap();
        assert_eq!(local_entries(&locks), 0);
    }

    #[test]
    fn lock_error_is_retryable() {
        let err: StorageError = LockError::Timeout {
            name: "0.shard".to_string(),
            timeout: Duration::from_millis(1),
        }
        .into();
        assert!(err.is_retryable());
        assert!(matches!(err, StorageError::LockTimeout(name) if name == "0.shard"));
    }
}
