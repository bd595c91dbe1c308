//! Sharded store options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardstore_container::ContainerKind;

use crate::lock::{
    DistributedLockService, FileLockService, LockCoordinator, LockMode, DEFAULT_LOCK_TIMEOUT,
};
use crate::sharded_store::ShardedStoreCreateError;

/// The default shard depth.
pub const DEFAULT_CONSOLIDATE_DEPTH: usize = 3;

/// Options of a [`ShardedStore`](crate::ShardedStore).
///
/// The default values are:
/// - `consolidate_depth`: `3`
/// - `write_direct`: `true`
/// - `container_kind`: [`ContainerKind::RandomAccess`]
/// - `container_extension`: the default extension of the container kind
/// - `lock_mode`: [`LockMode::Disabled`]
/// - `lock_timeout`: 30 seconds
/// - `parallelism`: number of threads available to Rayon
/// - `auto_scope`: `true`
/// - `archive_rewrite`: `false`
/// - `verify_writes`: `false`
/// - `read_only`: `false`
/// - `consolidate_on_open`: `false`
#[derive(Debug, Clone)]
pub struct ShardedStoreOptions {
    consolidate_depth: usize,
    write_direct: bool,
    container_kind: ContainerKind,
    container_extension: Option<String>,
    lock_mode: LockMode,
    lock_timeout: Duration,
    lock_service: Option<Arc<dyn DistributedLockService>>,
    lock_coordinator: Option<Arc<LockCoordinator>>,
    parallelism: usize,
    auto_scope: bool,
    archive_rewrite: bool,
    verify_writes: bool,
    read_only: bool,
    consolidate_on_open: bool,
}

impl Default for ShardedStoreOptions {
    fn default() -> Self {
        Self {
            consolidate_depth: DEFAULT_CONSOLIDATE_DEPTH,
            write_direct: true,
            container_kind: ContainerKind::default(),
            container_extension: None,
            lock_mode: LockMode::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_service: None,
            lock_coordinator: None,
            parallelism: rayon::current_num_threads(),
            auto_scope: true,
            archive_rewrite: false,
            verify_writes: false,
            read_only: false,
            consolidate_on_open: false,
        }
    }
}

impl ShardedStoreOptions {
    /// Return the shard depth.
    #[must_use]
    pub fn consolidate_depth(&self) -> usize {
        self.consolidate_depth
    }

    /// Set the shard depth: the number of trailing key segments addressing a chunk within a container, including the container segment.
    ///
    /// A depth below 2 disables containers.
    pub fn set_consolidate_depth(&mut self, consolidate_depth: usize) -> &mut Self {
        self.consolidate_depth = consolidate_depth;
        self
    }

    /// Set the shard depth.
    #[must_use]
    pub fn with_consolidate_depth(mut self, consolidate_depth: usize) -> Self {
        self.consolidate_depth = consolidate_depth;
        self
    }

    /// Return the direct write setting.
    #[must_use]
    pub fn write_direct(&self) -> bool {
        self.write_direct
    }

    /// Set whether containerized keys are written directly into containers.
    ///
    /// If false, all keys are written as loose files until consolidated.
    pub fn set_write_direct(&mut self, write_direct: bool) -> &mut Self {
        self.write_direct = write_direct;
        self
    }

    /// Set whether containerized keys are written directly into containers.
    #[must_use]
    pub fn with_write_direct(mut self, write_direct: bool) -> Self {
        self.write_direct = write_direct;
        self
    }

    /// Return the container kind.
    #[must_use]
    pub fn container_kind(&self) -> ContainerKind {
        self.container_kind
    }

    /// Set the container kind.
    pub fn set_container_kind(&mut self, container_kind: ContainerKind) -> &mut Self {
        self.container_kind = container_kind;
        self
    }

    /// Set the container kind.
    #[must_use]
    pub fn with_container_kind(mut self, container_kind: ContainerKind) -> Self {
        self.container_kind = container_kind;
        self
    }

    /// Return the container extension.
    ///
    /// This is the default extension of the container kind unless set explicitly.
    #[must_use]
    pub fn container_extension(&self) -> &str {
        self.container_extension
            .as_deref()
            .unwrap_or_else(|| self.container_kind.default_extension())
    }

    /// Set the container extension.
    pub fn set_container_extension(&mut self, container_extension: impl Into<String>) -> &mut Self {
        self.container_extension = Some(container_extension.into());
        self
    }

    /// Set the container extension.
    #[must_use]
    pub fn with_container_extension(mut self, container_extension: impl Into<String>) -> Self {
        self.container_extension = Some(container_extension.into());
        self
    }

    /// Return the lock mode.
    ///
    /// This is the mode of the lock coordinator if one is set.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_coordinator
            .as_ref()
            .map_or(self.lock_mode, |locks| locks.mode())
    }

    /// Set the lock mode.
    ///
    /// [`LockMode::Distributed`] requires a lock service.
    pub fn set_lock_mode(&mut self, lock_mode: LockMode) -> &mut Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Set the lock mode.
    #[must_use]
    pub fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    /// Return the distributed lock timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Set the distributed lock timeout.
    pub fn set_lock_timeout(&mut self, lock_timeout: Duration) -> &mut Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Set the distributed lock timeout.
    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Set the distributed lock service and switch to [`LockMode::Distributed`].
    pub fn set_lock_service(&mut self, lock_service: Arc<dyn DistributedLockService>) -> &mut Self {
        self.lock_service = Some(lock_service);
        self.lock_mode = LockMode::Distributed;
        self
    }

    /// Set the distributed lock service and switch to [`LockMode::Distributed`].
    #[must_use]
    pub fn with_lock_service(mut self, lock_service: Arc<dyn DistributedLockService>) -> Self {
        self.set_lock_service(lock_service);
        self
    }

    /// Set a lock coordinator shared with other stores.
    ///
    /// A shared coordinator takes precedence over the lock mode, timeout, and service.
    pub fn set_lock_coordinator(&mut self, lock_coordinator: Arc<LockCoordinator>) -> &mut Self {
        self.lock_coordinator = Some(lock_coordinator);
        self
    }

    /// Set a lock coordinator shared with other stores.
    #[must_use]
    pub fn with_lock_coordinator(mut self, lock_coordinator: Arc<LockCoordinator>) -> Self {
        self.lock_coordinator = Some(lock_coordinator);
        self
    }

    /// Return the number of consolidation workers.
    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Set the number of consolidation workers. A parallelism of 0 or 1 consolidates sequentially.
    pub fn set_parallelism(&mut self, parallelism: usize) -> &mut Self {
        self.parallelism = parallelism;
        self
    }

    /// Set the number of consolidation workers.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Return the auto scope setting.
    #[must_use]
    pub fn auto_scope(&self) -> bool {
        self.auto_scope
    }

    /// Set whether consolidating a group root consolidates each array below it.
    ///
    /// If false, consolidating a non-array root that holds arrays is refused.
    pub fn set_auto_scope(&mut self, auto_scope: bool) -> &mut Self {
        self.auto_scope = auto_scope;
        self
    }

    /// Set whether consolidating a group root consolidates each array below it.
    #[must_use]
    pub fn with_auto_scope(mut self, auto_scope: bool) -> Self {
        self.auto_scope = auto_scope;
        self
    }

    /// Return the archive rewrite setting.
    #[must_use]
    pub fn archive_rewrite(&self) -> bool {
        self.archive_rewrite
    }

    /// Set whether existing archive members may be replaced by rewriting the whole archive.
    pub fn set_archive_rewrite(&mut self, archive_rewrite: bool) -> &mut Self {
        self.archive_rewrite = archive_rewrite;
        self
    }

    /// Set whether existing archive members may be replaced by rewriting the whole archive.
    #[must_use]
    pub fn with_archive_rewrite(mut self, archive_rewrite: bool) -> Self {
        self.archive_rewrite = archive_rewrite;
        self
    }

    /// Return the write verification setting.
    #[must_use]
    pub fn verify_writes(&self) -> bool {
        self.verify_writes
    }

    /// Set whether container members are read back after each write and rewritten if they do not match.
    pub fn set_verify_writes(&mut self, verify_writes: bool) -> &mut Self {
        self.verify_writes = verify_writes;
        self
    }

    /// Set whether container members are read back after each write and rewritten if they do not match.
    #[must_use]
    pub fn with_verify_writes(mut self, verify_writes: bool) -> Self {
        self.verify_writes = verify_writes;
        self
    }

    /// Return the read only setting.
    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Set whether the store is opened read only.
    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }

    /// Set whether the store is opened read only.
    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Return the consolidate on open setting.
    #[must_use]
    pub fn consolidate_on_open(&self) -> bool {
        self.consolidate_on_open
    }

    /// Set whether the whole store is consolidated when opened.
    pub fn set_consolidate_on_open(&mut self, consolidate_on_open: bool) -> &mut Self {
        self.consolidate_on_open = consolidate_on_open;
        self
    }

    /// Set whether the whole store is consolidated when opened.
    #[must_use]
    pub fn with_consolidate_on_open(mut self, consolidate_on_open: bool) -> Self {
        self.consolidate_on_open = consolidate_on_open;
        self
    }

    /// Create the lock coordinator described by these options.
    pub(crate) fn create_lock_coordinator(
        &self,
    ) -> Result<Arc<LockCoordinator>, ShardedStoreCreateError> {
        if let Some(lock_coordinator) = &self.lock_coordinator {
            return Ok(lock_coordinator.clone());
        }
        Ok(Arc::new(match self.lock_mode {
            LockMode::Disabled => LockCoordinator::disabled(),
            LockMode::Local => LockCoordinator::local(),
            LockMode::Distributed => {
                let service = self.lock_service.clone().ok_or_else(|| {
                    ShardedStoreCreateError::InvalidConfiguration(
                        "the distributed lock mode requires a lock service".to_string(),
                    )
                })?;
                LockCoordinator::distributed(service, self.lock_timeout)
            }
        }))
    }
}

/// A serialisable [`ShardedStoreOptions`] document.
///
/// Absent fields take their default value.
/// A `lock_directory` provides a [`FileLockService`] for the distributed lock mode.
///
/// ```json
/// {
///     "consolidate_depth": 3,
///     "write_direct": false,
///     "container_kind": "archive",
///     "lock_mode": "distributed",
///     "lock_directory": "/shared/locks",
///     "lock_timeout_ms": 5000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct ShardedStoreConfig {
    /// The shard depth.
    pub consolidate_depth: usize,
    /// Whether containerized keys are written directly into containers.
    pub write_direct: bool,
    /// The container kind.
    pub container_kind: ContainerKind,
    /// The container extension. Defaults to the extension of the container kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_extension: Option<String>,
    /// The lock mode.
    pub lock_mode: LockMode,
    /// The directory of lock files for the distributed lock mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_directory: Option<PathBuf>,
    /// The distributed lock timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// The number of consolidation workers. Defaults to the number of threads available to Rayon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<usize>,
    /// Whether consolidating a group root consolidates each array below it.
    pub auto_scope: bool,
    /// Whether existing archive members may be replaced by rewriting the whole archive.
    pub archive_rewrite: bool,
    /// Whether container members are read back after each write.
    pub verify_writes: bool,
    /// Whether the store is opened read only.
    pub read_only: bool,
    /// Whether the whole store is consolidated when opened.
    pub consolidate_on_open: bool,
}

impl Default for ShardedStoreConfig {
    fn default() -> Self {
        let options = ShardedStoreOptions::default();
        Self {
            consolidate_depth: options.consolidate_depth,
            write_direct: options.write_direct,
            container_kind: options.container_kind,
            container_extension: None,
            lock_mode: options.lock_mode,
            lock_directory: None,
            lock_timeout_ms: u64::try_from(options.lock_timeout.as_millis()).unwrap_or(u64::MAX),
            parallelism: None,
            auto_scope: options.auto_scope,
            archive_rewrite: options.archive_rewrite,
            verify_writes: options.verify_writes,
            read_only: options.read_only,
            consolidate_on_open: options.consolidate_on_open,
        }
    }
}

impl TryFrom<ShardedStoreConfig> for ShardedStoreOptions {
    type Error = ShardedStoreCreateError;

    fn try_from(config: ShardedStoreConfig) -> Result<Self, Self::Error> {
        let mut options = Self::default();
        options
            .set_consolidate_depth(config.consolidate_depth)
            .set_write_direct(config.write_direct)
            .set_container_kind(config.container_kind)
            .set_lock_mode(config.lock_mode)
            .set_lock_timeout(Duration::from_millis(config.lock_timeout_ms))
            .set_auto_scope(config.auto_scope)
            .set_archive_rewrite(config.archive_rewrite)
            .set_verify_writes(config.verify_writes)
            .set_read_only(config.read_only)
            .set_consolidate_on_open(config.consolidate_on_open);
        if let Some(container_extension) = config.container_extension {
            options.set_container_extension(container_extension);
        }
        if let Some(parallelism) = config.parallelism {
            options.set_parallelism(parallelism);
        }
        if let Some(lock_directory) = config.lock_directory {
            if config.lock_mode != LockMode::Distributed {
                return Err(ShardedStoreCreateError::InvalidConfiguration(
                    "a lock directory requires the distributed lock mode".to_string(),
                ));
            }
            options.set_lock_service(Arc::new(FileLockService::new(lock_directory)?));
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_defaults() {
        let options = ShardedStoreOptions::default();
        assert_eq!(options.consolidate_depth(), 3);
        assert!(options.write_direct());
        assert_eq!(options.container_kind(), ContainerKind::RandomAccess);
        assert_eq!(options.container_extension(), ".shard");
        assert_eq!(options.lock_mode(), LockMode::Disabled);
        assert_eq!(options.lock_timeout(), Duration::from_secs(30));
        assert_eq!(options.parallelism(), rayon::current_num_threads());
        assert!(options.auto_scope());
        assert!(!options.archive_rewrite());
        assert!(!options.verify_writes());
        assert!(!options.read_only());
        assert!(!options.consolidate_on_open());

        let options = options.with_container_kind(ContainerKind::Archive);
        assert_eq!(options.container_extension(), ".zip");
        let options = options.with_container_extension(".h5z");
        assert_eq!(options.container_extension(), ".h5z");
    }

    #[test]
    fn options_distributed_requires_service() {
        let options = ShardedStoreOptions::default().with_lock_mode(LockMode::Distributed);
        assert!(matches!(
            options.create_lock_coordinator(),
            Err(ShardedStoreCreateError::InvalidConfiguration(_))
        ));

        let locks = Arc::new(LockCoordinator::local());
        let options = options.with_lock_coordinator(locks.clone());
        assert_eq!(options.lock_mode(), LockMode::Local);
        assert!(Arc::ptr_eq(&options.create_lock_coordinator().unwrap(), &locks));
    }

    #[test]
    fn options_from_config() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let json = format!(
            r#"{{
                "consolidate_depth": 4,
                "write_direct": false,
                "container_kind": "archive",
                "lock_mode": "distributed",
                "lock_directory": {:?},
                "lock_timeout_ms": 250,
                "parallelism": 2,
                "verify_writes": true
            }}"#,
            dir.path().join("locks")
        );
        let config: ShardedStoreConfig = serde_json::from_str(&json)?;
        let options = ShardedStoreOptions::try_from(config)?;
        assert_eq!(options.consolidate_depth(), 4);
        assert!(!options.write_direct());
        assert_eq!(options.container_extension(), ".zip");
        assert_eq!(options.lock_mode(), LockMode::Distributed);
        assert_eq!(options.lock_timeout(), Duration::from_millis(250));
        assert_eq!(options.parallelism(), 2);
        assert!(options.verify_writes());
        assert!(options.create_lock_coordinator().is_ok());
        assert!(dir.path().join("locks").is_dir());
        Ok(())
    }

    #[test]
    fn options_config_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config: ShardedStoreConfig = serde_json::from_str("{}")?;
        assert_eq!(config, ShardedStoreConfig::default());
        assert_eq!(config.lock_timeout_ms, 30_000);
        assert!(serde_json::from_str::<ShardedStoreConfig>(r#"{"depth": 3}"#).is_err());

        let config = ShardedStoreConfig {
            lock_directory: Some(PathBuf::from("locks")),
            ..ShardedStoreConfig::default()
        };
        assert!(matches!(
            ShardedStoreOptions::try_from(config),
            Err(ShardedStoreCreateError::InvalidConfiguration(_))
        ));
        Ok(())
    }
}
