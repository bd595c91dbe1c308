//! The sharded store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use shardstore_container::{Container, ContainerBackend, ContainerError};
use shardstore_filesystem::{FilesystemStore, FilesystemStoreCreateError};
use shardstore_storage::{
    Bytes, ListableStorageTraits, MaybeBytes, ReadableStorageTraits, StorageError, StoreKey,
    StoreKeys, StoreKeysPrefixes, StorePrefix, WritableStorageTraits,
};
use thiserror::Error;

use crate::consolidation::{
    is_array_dir, ConsolidationEngine, ConsolidationError, ConsolidationEvent,
    ConsolidationSummary,
};
use crate::key_mapper::KeyMapper;
use crate::lock::LockCoordinator;
use crate::options::ShardedStoreOptions;
use crate::worker_pool::WorkerPool;

/// The number of times a container member is written before a failed verification is an error.
const VERIFY_WRITE_ATTEMPTS: usize = 3;

type ContainerTable = Mutex<HashMap<String, Arc<RwLock<()>>>>;

/// An in-process guard on a container of a [`ShardedStore`].
///
/// The container is removed from the table of its store when the last guard referring to it is released.
pub(crate) struct ContainerGuard<'a, G> {
    containers: &'a ContainerTable,
    container: String,
    guard: Option<G>,
}

impl<G> Drop for ContainerGuard<'_, G> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut containers = self.containers.lock();
        if containers
            .get(&self.container)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            containers.remove(&self.container);
        }
    }
}

type ContainerReadGuard<'a> = ContainerGuard<'a, ArcRwLockReadGuard<RawRwLock, ()>>;
pub(crate) type ContainerWriteGuard<'a> = ContainerGuard<'a, ArcRwLockWriteGuard<RawRwLock, ()>>;

/// A container reachable from a store prefix.
struct ScopedContainer {
    /// The container path relative to the store root.
    container: String,
    /// The member prefix within the container covered by the store prefix.
    member_prefix: String,
}

/// A sharded nested directory store.
///
/// Keys are stored either as loose files, exactly as a [`FilesystemStore`] stores them, or as members of container files.
/// The [`KeyMapper`] decides which keys are containerized: with the default shard depth of 3, the key `array/0/1/2` is stored as member `1/2` of the container `array/0.shard`.
///
/// Reads consult the container of a key first and fall back to its loose file, so a store is readable at every stage of a migration from the loose layout to the sharded layout.
/// Loose entries are migrated into containers by [`ShardedStore::consolidate`].
///
/// Writes to a container are guarded by the [`LockCoordinator`] of the store.
/// Within one store instance, reads and writes of the same container are also serialised.
///
/// A key is only written directly into its container if the container lies inside the nearest array enclosing the key, so that sibling arrays never share a container.
/// Other keys are written as loose files.
#[derive(Debug)]
pub struct ShardedStore {
    loose: FilesystemStore,
    mapper: KeyMapper,
    backend: Arc<dyn ContainerBackend>,
    locks: Arc<LockCoordinator>,
    workers: WorkerPool,
    options: ShardedStoreOptions,
    readonly: bool,
    containers: ContainerTable,
    array_roots: RwLock<HashMap<StorePrefix, bool>>,
    closed: AtomicBool,
}

impl ShardedStore {
    /// Open a sharded store at `base_path` with default options.
    ///
    /// # Errors
    /// Returns a [`ShardedStoreCreateError`] if `base_path` is not valid or is an existing file.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, ShardedStoreCreateError> {
        Self::open(base_path, ShardedStoreOptions::default())
    }

    /// Open a sharded store at `base_path` with `options`.
    ///
    /// The store is read only if [`ShardedStoreOptions::read_only`] is set or `base_path` is not writable.
    /// If [`ShardedStoreOptions::consolidate_on_open`] is set, the whole store is consolidated before returning.
    ///
    /// # Errors
    /// Returns a [`ShardedStoreCreateError`] if `base_path` is not valid or is an existing file, the options are not valid, or consolidation on open fails.
    pub fn open<P: AsRef<Path>>(
        base_path: P,
        options: ShardedStoreOptions,
    ) -> Result<Self, ShardedStoreCreateError> {
        let backend = options
            .container_kind()
            .backend(options.container_extension())
            .map_err(|err| ShardedStoreCreateError::InvalidConfiguration(err.to_string()))?;
        let locks = options.create_lock_coordinator()?;
        let loose = FilesystemStore::new(base_path)?.sorted();
        let readonly = options.read_only() || loose.readonly();

        let store = Self {
            mapper: KeyMapper::new(options.consolidate_depth(), backend.extension()),
            workers: WorkerPool::new(options.parallelism()),
            loose,
            backend,
            locks,
            readonly,
            containers: Mutex::default(),
            array_roots: RwLock::default(),
            closed: AtomicBool::new(false),
            options,
        };

        if store.options.consolidate_on_open() && !store.readonly {
            store.consolidate(&StorePrefix::root())?;
        }
        Ok(store)
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        self.loose.base_path()
    }

    /// Returns the store options.
    #[must_use]
    pub fn options(&self) -> &ShardedStoreOptions {
        &self.options
    }

    /// Returns the key mapper.
    #[must_use]
    pub fn key_mapper(&self) -> &KeyMapper {
        &self.mapper
    }

    /// Returns the container backend.
    #[must_use]
    pub fn container_backend(&self) -> &Arc<dyn ContainerBackend> {
        &self.backend
    }

    /// Returns the lock coordinator, which can be shared with other stores.
    #[must_use]
    pub fn lock_coordinator(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    /// Returns true if the store is read only.
    #[must_use]
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Returns true if the store has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the store. Subsequent operations fail with [`StorageError::Closed`].
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("closed store {}", self.base_path().display());
        }
    }

    /// Consolidate the loose entries under `root` into containers.
    ///
    /// See [`ConsolidationEngine`].
    ///
    /// # Errors
    /// Returns a [`ConsolidationError`] if the store is read only or closed, `root` is a group root and auto scope is disabled, or the store cannot be scanned.
    /// Failures of individual containers are reported in the [`ConsolidationSummary`].
    pub fn consolidate(
        &self,
        root: &StorePrefix,
    ) -> Result<ConsolidationSummary, ConsolidationError> {
        ConsolidationEngine::new(self).run(root)
    }

    /// Consolidate the loose entries under `root` into containers, calling `progress` for each [`ConsolidationEvent`].
    ///
    /// `progress` is called from the consolidation workers once the container an event refers to has been released, so it may read the store.
    ///
    /// # Errors
    /// See [`ShardedStore::consolidate`].
    pub fn consolidate_with_progress(
        &self,
        root: &StorePrefix,
        progress: &(dyn Fn(&ConsolidationEvent) + Send + Sync),
    ) -> Result<ConsolidationSummary, ConsolidationError> {
        ConsolidationEngine::new(self).with_progress(progress).run(root)
    }

    /// Compact all random access containers reachable from `prefix`, reclaiming the space of replaced and deleted members.
    ///
    /// Returns the number of bytes reclaimed.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store is read only or closed, a lock cannot be acquired, or a container cannot be compacted.
    pub fn compact_containers(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        self.ensure_writable()?;
        let mut reclaimed = 0;
        let containers: BTreeSet<String> = self
            .containers_in(prefix)?
            .into_iter()
            .map(|scoped| scoped.container)
            .collect();
        for container in containers {
            let _lock = self.locks.acquire(&container)?;
            let _guard = self.write_container(&container);
            if let Some(mut handle) = self.open_existing(&container)? {
                reclaimed += handle.compact()?;
                handle.close()?;
            }
        }
        Ok(reclaimed)
    }

    pub(crate) fn loose(&self) -> &FilesystemStore {
        &self.loose
    }

    pub(crate) fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub(crate) fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.readonly {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Maps a container path relative to the store root to a filesystem [`PathBuf`].
    pub(crate) fn container_path(&self, container: &str) -> PathBuf {
        let mut path = self.base_path().to_path_buf();
        path.extend(container.split('/'));
        path
    }

    fn container_mutex(&self, container: &str) -> Arc<RwLock<()>> {
        self.containers
            .lock()
            .entry(container.to_string())
            .or_default()
            .clone()
    }

    fn read_container(&self, container: &str) -> ContainerReadGuard<'_> {
        ContainerGuard {
            guard: Some(self.container_mutex(container).read_arc()),
            containers: &self.containers,
            container: container.to_string(),
        }
    }

    pub(crate) fn write_container(&self, container: &str) -> ContainerWriteGuard<'_> {
        ContainerGuard {
            guard: Some(self.container_mutex(container).write_arc()),
            containers: &self.containers,
            container: container.to_string(),
        }
    }

    /// Open an existing container for writing.
    pub(crate) fn open_existing(
        &self,
        container: &str,
    ) -> Result<Option<Box<dyn Container>>, StorageError> {
        let path = self.container_path(container);
        if path.is_file() {
            Ok(Some(self.backend.open(&path)?))
        } else {
            Ok(None)
        }
    }

    /// Write `value` to `member` and sync the container.
    ///
    /// An existing archive member is only replaced if archive rewrites are enabled.
    /// If write verification is enabled, the member is read back and rewritten, at most [`VERIFY_WRITE_ATTEMPTS`] times in total, until it matches `value`.
    pub(crate) fn write_member(
        &self,
        container: &mut dyn Container,
        member: &str,
        value: &[u8],
    ) -> Result<(), ContainerError> {
        let mut rewrite = self.options.archive_rewrite();
        for attempt in 1..=VERIFY_WRITE_ATTEMPTS {
            if rewrite {
                container.rewrite(member, value)?;
            } else {
                container.write(member, value)?;
            }
            container.sync()?;
            if !self.options.verify_writes() || container.read(member)?.as_deref() == Some(value) {
                return Ok(());
            }
            log::warn!(
                "member {member} of container {} did not match the written value on attempt {attempt}",
                container.path().display()
            );
            rewrite = true;
        }
        Err(ContainerError::VerificationFailed {
            path: container.path().to_path_buf(),
            member: member.to_string(),
        })
    }

    /// Returns true if the directory of `prefix` is an array root.
    fn is_array_root(&self, prefix: &StorePrefix) -> bool {
        if let Some(&is_array) = self.array_roots.read().get(prefix) {
            return is_array;
        }
        let is_array = is_array_dir(&self.loose.prefix_to_fs_path(prefix));
        self.array_roots.write().insert(prefix.clone(), is_array);
        is_array
    }

    /// Returns the nearest array root enclosing `key`.
    fn enclosing_array(&self, key: &StoreKey) -> Option<StorePrefix> {
        let segments: Vec<&str> = key.segments().collect();
        (0..segments.len())
            .rev()
            .filter_map(|depth| {
                if depth == 0 {
                    Some(StorePrefix::root())
                } else {
                    StorePrefix::new(segments[..depth].join("/") + "/").ok()
                }
            })
            .find(|prefix| self.is_array_root(prefix))
    }

    /// Returns true if the container of `key` lies outside the nearest array enclosing `key`.
    fn is_fenced(&self, key: &StoreKey, container: &str) -> bool {
        self.enclosing_array(key)
            .is_some_and(|array| !container.starts_with(array.as_str()))
    }

    /// Forget the cached array roots at or below `prefix`.
    fn forget_array_roots(&self, prefix: &StorePrefix) {
        self.array_roots
            .write()
            .retain(|root, _| !root.as_str().starts_with(prefix.as_str()));
    }

    /// Forget the cached array root of a metadata document.
    fn forget_metadata(&self, key: &StoreKey) {
        if KeyMapper::is_metadata_key(key) {
            self.array_roots.write().remove(&key.parent());
        }
    }

    fn is_container_file(&self, key: &StoreKey) -> bool {
        self.mapper.container_key_for_path(key.as_str()).is_some()
    }

    /// Returns the containers below `prefix` and the containers enclosing `prefix`.
    fn containers_in(&self, prefix: &StorePrefix) -> Result<Vec<ScopedContainer>, StorageError> {
        let mut containers: Vec<ScopedContainer> = self
            .loose
            .list_prefix(prefix)?
            .into_iter()
            .filter(|key| self.is_container_file(key))
            .map(|key| ScopedContainer {
                container: key.as_str().to_string(),
                member_prefix: String::new(),
            })
            .collect();
        containers.extend(self.enclosing_containers(prefix));
        Ok(containers)
    }

    /// Returns the existing containers whose stem is `prefix` or one of its ancestors.
    fn enclosing_containers(&self, prefix: &StorePrefix) -> Vec<ScopedContainer> {
        let segments: Vec<&str> = prefix.segments().collect();
        (1..=segments.len())
            .filter_map(|depth| {
                let container = segments[..depth].join("/") + self.mapper.extension();
                self.container_path(&container)
                    .is_file()
                    .then(|| ScopedContainer {
                        container,
                        member_prefix: segments[depth..]
                            .iter()
                            .map(|segment| format!("{segment}/"))
                            .collect(),
                    })
            })
            .collect()
    }

    /// Open a container for reading, skipping corrupt containers with a warning.
    fn open_read_listing(&self, container: &str) -> Option<Box<dyn Container>> {
        match self.backend.open_read(&self.container_path(container)) {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("skipping container {container} in listing: {err}");
                None
            }
        }
    }

    /// Returns the size of every key under `prefix`. Container members take precedence over loose files.
    fn entries_prefix(&self, prefix: &StorePrefix) -> Result<BTreeMap<StoreKey, u64>, StorageError> {
        self.ensure_open()?;
        let mut entries = BTreeMap::new();
        for key in self.loose.list_prefix(prefix)? {
            if !self.is_container_file(&key) {
                if let Some(size) = self.loose.size_key(&key)? {
                    entries.insert(key, size);
                }
            }
        }

        for scoped in self.containers_in(prefix)? {
            let _guard = self.read_container(&scoped.container);
            let Some(handle) = self.open_read_listing(&scoped.container) else {
                continue;
            };
            for member in handle.members() {
                if !member.starts_with(&scoped.member_prefix) {
                    continue;
                }
                if let Some(key) = self.mapper.reconstruct(&scoped.container, &member) {
                    let size = handle.size_member(&member).unwrap_or_default();
                    entries.insert(key, size);
                }
            }
        }
        Ok(entries)
    }
}

impl ReadableStorageTraits for ShardedStore {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        self.ensure_open()?;
        if let Some(location) = self.mapper.map(key) {
            let _guard = self.read_container(location.container());
            let path = self.container_path(location.container());
            if let Some(mut container) = self.backend.open_read(&path)? {
                if let Some(value) = container.read(location.member())? {
                    return Ok(Some(value));
                }
            }
            return self.loose.get(key);
        }
        self.loose.get(key)
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        self.ensure_open()?;
        if let Some(location) = self.mapper.map(key) {
            let _guard = self.read_container(location.container());
            let path = self.container_path(location.container());
            if let Some(size) = self
                .backend
                .open_read(&path)?
                .and_then(|container| container.size_member(location.member()))
            {
                return Ok(Some(size));
            }
        }
        self.loose.size_key(key)
    }
}

impl WritableStorageTraits for ShardedStore {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let Some(location) = self.mapper.map(key) else {
            self.forget_metadata(key);
            return self.loose.set(key, value);
        };

        let write_direct =
            self.options.write_direct() && !self.is_fenced(key, location.container());
        let _lock = self.locks.acquire(location.container())?;
        let _guard = self.write_container(location.container());
        if write_direct {
            let path = self.container_path(location.container());
            let mut container = self.backend.open(&path)?;
            self.write_member(container.as_mut(), location.member(), &value)?;
            container.close()?;
            // Remove any stale loose copy
            self.loose.erase(key)
        } else {
            self.loose.set(key, value)?;
            if let Some(mut container) = self.open_existing(location.container())? {
                if container.contains(location.member()) {
                    container.delete(location.member())?;
                    container.close()?;
                }
            }
            Ok(())
        }
    }

    fn erase(&self, key: &StoreKey) -> Result<(), StorageError> {
        self.ensure_writable()?;
        if let Some(location) = self.mapper.map(key) {
            let _lock = self.locks.acquire(location.container())?;
            let _guard = self.write_container(location.container());
            if let Some(mut container) = self.open_existing(location.container())? {
                if container.contains(location.member()) {
                    container.delete(location.member())?;
                    container.close()?;
                }
            }
            return self.loose.erase(key);
        }
        self.forget_metadata(key);
        self.loose.erase(key)
    }

    fn erase_prefix(&self, prefix: &StorePrefix) -> Result<(), StorageError> {
        self.ensure_writable()?;
        for scoped in self.containers_in(prefix)? {
            let _lock = self.locks.acquire(&scoped.container)?;
            let _guard = self.write_container(&scoped.container);
            if scoped.member_prefix.is_empty() {
                match std::fs::remove_file(self.container_path(&scoped.container)) {
                    Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                        return Err(err.into());
                    }
                    _ => {}
                }
            } else if let Some(mut container) = self.open_existing(&scoped.container)? {
                for member in container.members() {
                    if member.starts_with(&scoped.member_prefix) {
                        container.delete(&member)?;
                    }
                }
                container.close()?;
            }
        }
        self.forget_array_roots(prefix);
        self.loose.erase_prefix(prefix)
    }
}

impl ListableStorageTraits for ShardedStore {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        self.list_prefix(&StorePrefix::root())
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        Ok(self.entries_prefix(prefix)?.into_keys().collect())
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        self.ensure_open()?;
        let loose = self.loose.list_dir(prefix)?;
        let mut keys = BTreeSet::new();
        let mut prefixes: BTreeSet<StorePrefix> = loose.prefixes().iter().cloned().collect();
        for key in loose.keys() {
            match self.mapper.container_key_for_path(key.as_str()) {
                Some(stem) => {
                    prefixes.insert(StorePrefix::new(format!("{stem}/"))?);
                }
                None => {
                    keys.insert(key.clone());
                }
            }
        }

        for scoped in self.enclosing_containers(prefix) {
            let Some(stem) = self.mapper.container_key_for_path(&scoped.container) else {
                continue;
            };
            let _guard = self.read_container(&scoped.container);
            let Some(handle) = self.open_read_listing(&scoped.container) else {
                continue;
            };
            let listing = handle.list(&scoped.member_prefix);
            for member in listing.members {
                keys.insert(StoreKey::new(format!("{stem}/{member}"))?);
            }
            for member_prefix in listing.prefixes {
                prefixes.insert(StorePrefix::new(format!("{stem}/{member_prefix}"))?);
            }
        }

        Ok(StoreKeysPrefixes::new(
            keys.into_iter().collect(),
            prefixes.into_iter().collect(),
        ))
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        Ok(self.entries_prefix(prefix)?.into_values().sum())
    }
}

/// A sharded store creation error.
#[derive(Debug, Error)]
pub enum ShardedStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The path is not valid on this system.
    #[error("base path {0} is not valid")]
    InvalidBasePath(PathBuf),
    /// The path exists and is not a directory.
    #[error("base path {0} exists and is not a directory")]
    NotADirectory(PathBuf),
    /// The options are not valid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// Consolidation on open failed.
    #[error(transparent)]
    Consolidation(#[from] ConsolidationError),
}

impl From<FilesystemStoreCreateError> for ShardedStoreCreateError {
    fn from(err: FilesystemStoreCreateError) -> Self {
        match err {
            FilesystemStoreCreateError::IOError(err) => Self::IOError(err),
            FilesystemStoreCreateError::InvalidBasePath(path) => Self::InvalidBasePath(path),
            FilesystemStoreCreateError::NotADirectory(path) => Self::NotADirectory(path),
        }
    }
}
