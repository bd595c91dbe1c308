//! Consolidation of loose entries into containers.
//!
//! Consolidation migrates a store from the loose nested directory layout to the sharded layout in place.
//! It is scoped to arrays: a directory is an array root if it holds a `.zarray` document or a `zarr.json` document with a `node_type` of `array`.
//!
//! For each array root under the consolidation root, every loose entry that the [`KeyMapper`](crate::key_mapper::KeyMapper) assigns to a container inside the array root is moved into that container.
//! Nested arrays are consolidated on their own and never swept into the containers of an enclosing array.
//! Entries are grouped by container and each group is processed by one worker of the [`WorkerPool`](crate::worker_pool::WorkerPool) while it holds the container lock.
//!
//! An entry is moved by writing it to its container, syncing the container, and then removing the loose file.
//! If consolidation is interrupted, an entry is in its container, its loose file, or both, and is readable throughout.
//! A later run removes the loose file of an entry whose container member already holds the same value, and otherwise writes the loose value again.
//! An entry that fails to move does not stop the other entries of its container.
//! Empty directories left behind are removed bottom-up once every group has been processed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use shardstore_container::Container;
use shardstore_filesystem::is_partial_file;
use shardstore_storage::{
    ReadableStorageTraits, StorageError, StoreKey, StorePrefix, WritableStorageTraits,
};
use thiserror::Error;
use walkdir::WalkDir;

use crate::ShardedStore;

/// A progress callback, called from consolidation workers.
///
/// Events of a container are reported once the container has been released.
pub type ConsolidationProgress<'a> = &'a (dyn Fn(&ConsolidationEvent) + Send + Sync);

/// A consolidation progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsolidationEvent {
    /// The loose entries of an array were grouped by container.
    ArrayScoped {
        /// The array root.
        array: StorePrefix,
        /// The number of loose entries to move.
        entries: usize,
        /// The number of containers receiving entries.
        containers: usize,
    },
    /// A container was opened for consolidation.
    ContainerOpened {
        /// The container path relative to the store root.
        container: String,
    },
    /// A loose entry was moved into its container.
    EntryMoved {
        /// The store key of the entry.
        key: StoreKey,
        /// The container path relative to the store root.
        container: String,
    },
    /// All entries of a container were moved.
    ContainerCompleted {
        /// The container path relative to the store root.
        container: String,
        /// The number of entries moved.
        entries: usize,
    },
    /// An empty directory was removed.
    EmptyDirRemoved {
        /// The removed directory.
        path: PathBuf,
    },
    /// Consolidation of a container failed. Other containers are unaffected.
    ContainerFailed {
        /// The container path relative to the store root.
        container: String,
        /// The failure.
        error: String,
    },
}

/// A container that failed to consolidate.
#[derive(Debug)]
pub struct ContainerFailure {
    /// The container path relative to the store root.
    pub container: String,
    /// The first failure.
    pub error: StorageError,
    /// The number of entries of the container moved despite the failure.
    pub entries_moved: usize,
}

/// The outcome of a consolidation run.
#[derive(Debug, Default)]
pub struct ConsolidationSummary {
    arrays: usize,
    containers: usize,
    entries_moved: usize,
    directories_removed: usize,
    failures: Vec<ContainerFailure>,
}

impl ConsolidationSummary {
    /// The number of array roots consolidated.
    #[must_use]
    pub fn arrays(&self) -> usize {
        self.arrays
    }

    /// The number of containers that received entries, including failed containers.
    #[must_use]
    pub fn containers(&self) -> usize {
        self.containers
    }

    /// The number of loose entries moved into containers, including entries of failed containers.
    #[must_use]
    pub fn entries_moved(&self) -> usize {
        self.entries_moved
    }

    /// The number of empty directories removed.
    #[must_use]
    pub fn directories_removed(&self) -> usize {
        self.directories_removed
    }

    /// The containers that failed to consolidate.
    #[must_use]
    pub fn failures(&self) -> &[ContainerFailure] {
        &self.failures
    }

    /// Returns true if no container failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A consolidation error.
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// The consolidation root is not an array root and holds arrays, but auto scope is disabled.
    #[error("{root:?} is not an array and holds {arrays} arrays, consolidate an array or enable auto scope")]
    Misuse {
        /// The consolidation root.
        root: String,
        /// The number of arrays under the root.
        arrays: usize,
    },
    /// A storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Deserialize)]
struct NodeMetadata {
    node_type: String,
}

/// Returns true if the directory at `path` is an array root.
pub(crate) fn is_array_dir(path: &Path) -> bool {
    if path.join(".zarray").is_file() {
        return true;
    }
    let metadata_path = path.join("zarr.json");
    let Ok(metadata) = std::fs::read(&metadata_path) else {
        return false;
    };
    match serde_json::from_slice::<NodeMetadata>(&metadata) {
        Ok(metadata) => metadata.node_type == "array",
        Err(err) => {
            log::warn!("ignoring invalid metadata {}: {err}", metadata_path.display());
            false
        }
    }
}

/// A loose entry and its container member.
struct Entry {
    key: StoreKey,
    member: String,
}

/// Moves loose entries of a [`ShardedStore`] into containers.
///
/// See the [module documentation](crate::consolidation).
pub struct ConsolidationEngine<'a> {
    store: &'a ShardedStore,
    progress: Option<ConsolidationProgress<'a>>,
}

impl<'a> ConsolidationEngine<'a> {
    /// Create a consolidation engine for `store`.
    #[must_use]
    pub fn new(store: &'a ShardedStore) -> Self {
        Self {
            store,
            progress: None,
        }
    }

    /// Report each [`ConsolidationEvent`] to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: ConsolidationProgress<'a>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Returns the array roots at or below `root`, in lexicographical order.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store is closed.
    pub fn find_arrays(&self, root: &StorePrefix) -> Result<Vec<StorePrefix>, StorageError> {
        self.store.ensure_open()?;
        let loose = self.store.loose();
        let root_path = loose.prefix_to_fs_path(root);
        let mut arrays = Vec::new();
        for entry in WalkDir::new(&root_path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir() && is_array_dir(entry.path()))
        {
            if entry.path() == loose.base_path() {
                arrays.push(StorePrefix::root());
            } else {
                let key = loose.fspath_to_key(entry.path())?;
                arrays.push(StorePrefix::new(format!("{}/", key.as_str()))?);
            }
        }
        arrays.sort();
        Ok(arrays)
    }

    /// Consolidate the loose entries under `root`.
    ///
    /// If `root` is not an array root, every array under `root` is consolidated when auto scope is enabled.
    /// Nothing is moved if there are no arrays under `root`.
    ///
    /// # Errors
    /// Returns a [`ConsolidationError`] if the store is read only or closed, `root` is a group root with arrays and auto scope is disabled, or the store cannot be scanned.
    /// Failures of individual containers do not stop consolidation and are reported in the [`ConsolidationSummary`].
    pub fn run(&self, root: &StorePrefix) -> Result<ConsolidationSummary, ConsolidationError> {
        self.store.ensure_writable()?;
        let arrays = self.find_arrays(root)?;
        if !arrays.is_empty() && !arrays.contains(root) && !self.store.options().auto_scope() {
            return Err(ConsolidationError::Misuse {
                root: root.as_str().to_string(),
                arrays: arrays.len(),
            });
        }
        log::info!(
            "consolidating {} arrays under {}",
            arrays.len(),
            self.store.loose().prefix_to_fs_path(root).display()
        );

        let mut groups = Vec::new();
        for array in &arrays {
            let nested: Vec<&StorePrefix> = arrays
                .iter()
                .filter(|other| *other != array && other.as_str().starts_with(array.as_str()))
                .collect();
            let array_groups = self.scope(array, &nested)?;
            self.emit(ConsolidationEvent::ArrayScoped {
                array: array.clone(),
                entries: array_groups.values().map(Vec::len).sum(),
                containers: array_groups.len(),
            });
            groups.extend(array_groups);
        }

        let mut summary = ConsolidationSummary {
            arrays: arrays.len(),
            containers: groups.len(),
            ..Default::default()
        };
        let results = self
            .store
            .workers()
            .try_for_each_group(groups, |(container, entries)| {
                let mut events = Vec::new();
                let result = self.move_group(&container, entries, &mut events);
                for event in events {
                    self.emit(event);
                }
                result
            });
        for result in results {
            match result {
                Ok(moved) => summary.entries_moved += moved,
                Err(failure) => {
                    self.emit(ConsolidationEvent::ContainerFailed {
                        container: failure.container.clone(),
                        error: failure.error.to_string(),
                    });
                    summary.entries_moved += failure.entries_moved;
                    summary.failures.push(failure);
                }
            }
        }

        for array in &arrays {
            for path in self.store.loose().prune_empty_directories(array)? {
                summary.directories_removed += 1;
                self.emit(ConsolidationEvent::EmptyDirRemoved { path });
            }
        }

        log::info!(
            "consolidated {} entries into {} containers with {} failures",
            summary.entries_moved,
            summary.containers,
            summary.failures.len()
        );
        Ok(summary)
    }

    /// Group the loose entries of `array` by container, skipping the `nested` arrays.
    fn scope(
        &self,
        array: &StorePrefix,
        nested: &[&StorePrefix],
    ) -> Result<BTreeMap<String, Vec<Entry>>, StorageError> {
        let loose = self.store.loose();
        let nested_paths: Vec<PathBuf> = nested
            .iter()
            .map(|prefix| loose.prefix_to_fs_path(prefix))
            .collect();
        let mut groups: BTreeMap<String, Vec<Entry>> = BTreeMap::new();
        for entry in WalkDir::new(loose.prefix_to_fs_path(array))
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !nested_paths.iter().any(|path| entry.path() == path))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("skipping unreadable entry during consolidation: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file()
                || is_partial_file(&entry.file_name().to_string_lossy())
                || self.store.container_backend().is_container_path(entry.path())
            {
                continue;
            }
            let key = loose.fspath_to_key(entry.path())?;
            let Some(location) = self.store.key_mapper().map(&key) else {
                continue;
            };
            // The container must lie inside the array
            if !location.container().starts_with(array.as_str()) {
                continue;
            }
            groups
                .entry(location.container().to_string())
                .or_default()
                .push(Entry {
                    member: location.member().to_string(),
                    key,
                });
        }
        Ok(groups)
    }

    /// Move `entries` into `container` while holding its locks, returning the number moved.
    ///
    /// Progress events are collected in `events` to be reported after the locks are released.
    fn move_group(
        &self,
        container: &str,
        entries: Vec<Entry>,
        events: &mut Vec<ConsolidationEvent>,
    ) -> Result<usize, ContainerFailure> {
        let store = self.store;
        let failure = |error: StorageError, entries_moved| ContainerFailure {
            container: container.to_string(),
            error,
            entries_moved,
        };
        let _lock = store
            .lock_coordinator()
            .acquire(container)
            .map_err(|err| failure(err.into(), 0))?;
        let _guard = store.write_container(container);
        let mut handle = store
            .container_backend()
            .open(&store.container_path(container))
            .map_err(|err| failure(err.into(), 0))?;
        events.push(ConsolidationEvent::ContainerOpened {
            container: container.to_string(),
        });

        let mut moved = 0;
        let mut error = None;
        for Entry { key, member } in entries {
            match self.move_entry(handle.as_mut(), &key, &member) {
                Ok(true) => {
                    moved += 1;
                    events.push(ConsolidationEvent::EntryMoved {
                        key,
                        container: container.to_string(),
                    });
                }
                Ok(false) => {}
                Err(err) => {
                    log::warn!("failed to move {key} into {container}: {err}");
                    error.get_or_insert(err);
                }
            }
        }
        if let Err(err) = handle.close() {
            error.get_or_insert(err.into());
        }
        match error {
            Some(error) => Err(failure(error, moved)),
            None => {
                events.push(ConsolidationEvent::ContainerCompleted {
                    container: container.to_string(),
                    entries: moved,
                });
                Ok(moved)
            }
        }
    }

    /// Move the loose entry `key` into `member` of `container`, returning false if it no longer exists.
    fn move_entry(
        &self,
        container: &mut dyn Container,
        key: &StoreKey,
        member: &str,
    ) -> Result<bool, StorageError> {
        let loose = self.store.loose();
        // Erased since scoping
        let Some(value) = loose.get(key)? else {
            return Ok(false);
        };
        // Moved by an interrupted run
        let migrated =
            container.contains(member) && container.read(member)?.as_deref() == Some(&value[..]);
        if !migrated {
            self.store.write_member(container, member, &value)?;
        }
        loose.erase(key)?;
        Ok(true)
    }

    fn emit(&self, event: ConsolidationEvent) {
        match &event {
            ConsolidationEvent::ArrayScoped {
                array,
                entries,
                containers,
            } => log::info!(
                "array {} has {entries} loose entries for {containers} containers",
                array.as_str()
            ),
            ConsolidationEvent::ContainerOpened { container } => {
                log::debug!("opened container {container}");
            }
            ConsolidationEvent::EntryMoved { key, container } => {
                log::debug!("moved {key} into {container}");
            }
            ConsolidationEvent::ContainerCompleted { container, entries } => {
                log::info!("consolidated {entries} entries into {container}");
            }
            // Logged by the filesystem store
            ConsolidationEvent::EmptyDirRemoved { .. } => {}
            ConsolidationEvent::ContainerFailed { container, error } => {
                log::warn!("failed to consolidate {container}: {error}");
            }
        }
        if let Some(progress) = self.progress {
            progress(&event);
        }
    }
}
