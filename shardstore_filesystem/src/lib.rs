//! A nested directory filesystem store for the [`shardstore`](https://docs.rs/shardstore) crates.
//!
//! Every value is a plain file at the path of its key relative to the store root, so a chunk key `array/0/1/2` is stored at `<root>/array/0/1/2`.
//! This is the loose layout that sharded stores fall back to and migrate from.
//!
//! ## Licence
//! `shardstore_filesystem` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.

use shardstore_storage::{
    Bytes, ListableStorageTraits, MaybeBytes, ReadableStorageTraits, StorageError, StoreKey,
    StoreKeyError, StoreKeys, StoreKeysPrefixes, StorePrefix, StorePrefixes,
    WritableStorageTraits,
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use walkdir::WalkDir;

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The file name suffix of in-flight atomic writes.
///
/// Files with this suffix are never listed as keys.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Returns true if `file_name` is an in-flight atomic write.
#[must_use]
pub fn is_partial_file(file_name: &str) -> bool {
    file_name.ends_with(PARTIAL_SUFFIX)
}

/// Options for use with [`FilesystemStore`]
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct FilesystemStoreOptions {
    atomic_write: bool,
}

impl Default for FilesystemStoreOptions {
    fn default() -> Self {
        Self { atomic_write: true }
    }
}

impl FilesystemStoreOptions {
    /// Set whether values are written to a temporary file and then renamed into place.
    ///
    /// Enabled by default. A reader never observes a partially written value when enabled.
    pub fn atomic_write(&mut self, atomic_write: bool) -> &mut Self {
        self.atomic_write = atomic_write;
        self
    }
}

/// A synchronous nested directory file system store.
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    sort: bool,
    readonly: bool,
    options: FilesystemStoreOptions,
    files: Mutex<HashMap<StoreKey, Arc<RwLock<()>>>>,
}

impl FilesystemStore {
    /// Create a new file system store at a given `base_path`.
    ///
    /// # Errors
    /// Returns a [`FilesystemStoreCreateError`] if `base_directory`:
    ///   - is not valid, or
    ///   - it points to an existing file rather than a directory.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, FilesystemStoreCreateError> {
        Self::new_with_options(base_path, FilesystemStoreOptions::default())
    }

    /// Create a new file system store at a given `base_path` and `options`.
    ///
    /// # Errors
    /// Returns a [`FilesystemStoreCreateError`] if `base_directory`:
    ///   - is not valid, or
    ///   - it points to an existing file rather than a directory.
    pub fn new_with_options<P: AsRef<Path>>(
        base_path: P,
        options: FilesystemStoreOptions,
    ) -> Result<Self, FilesystemStoreCreateError> {
        let base_path = base_path.as_ref().to_path_buf();
        if base_path.to_str().is_none() {
            return Err(FilesystemStoreCreateError::InvalidBasePath(base_path));
        }

        let readonly = if base_path.exists() {
            let md = std::fs::metadata(&base_path)?;
            if !md.is_dir() {
                return Err(FilesystemStoreCreateError::NotADirectory(base_path));
            }
            md.permissions().readonly()
        } else {
            // the path does not exist, so try and create it. If this succeeds, the filesystem is not read only
            std::fs::create_dir_all(&base_path)?;
            std::fs::remove_dir(&base_path)?;
            false
        };

        Ok(Self {
            base_path,
            sort: false,
            readonly,
            options,
            files: Mutex::default(),
        })
    }

    /// Makes the store sort directories/files when listing a directory.
    #[must_use]
    pub const fn sorted(mut self) -> Self {
        self.sort = true;
        self
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Returns true if the store root is read only.
    #[must_use]
    pub const fn readonly(&self) -> bool {
        self.readonly
    }

    /// Maps a [`StoreKey`] to a filesystem [`PathBuf`].
    #[must_use]
    pub fn key_to_fspath(&self, key: &StoreKey) -> PathBuf {
        let mut path = self.base_path.clone();
        path.extend(key.segments());
        path
    }

    /// Maps a filesystem [`PathBuf`] to a [`StoreKey`].
    ///
    /// # Errors
    /// Returns a [`StoreKeyError`] if `path` is not below the store root or does not form a valid key.
    pub fn fspath_to_key(&self, path: &Path) -> Result<StoreKey, StoreKeyError> {
        let path = pathdiff::diff_paths(path, &self.base_path)
            .ok_or_else(|| StoreKeyError::from(path.to_string_lossy().to_string()))?;
        let path_str = path.to_string_lossy();
        #[cfg(target_os = "windows")]
        {
            StoreKey::new(path_str.replace('\\', "/"))
        }
        #[cfg(not(target_os = "windows"))]
        {
            StoreKey::new(path_str)
        }
    }

    /// Maps a store [`StorePrefix`] to a filesystem [`PathBuf`].
    #[must_use]
    pub fn prefix_to_fs_path(&self, prefix: &StorePrefix) -> PathBuf {
        let mut path = self.base_path.clone();
        path.extend(prefix.segments());
        path
    }

    fn get_file_mutex(&self, key: &StoreKey) -> Arc<RwLock<()>> {
        self.files
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::default()))
            .clone()
    }

    fn set_impl(&self, key: &StoreKey, value: &[u8]) -> Result<(), StorageError> {
        let file = self.get_file_mutex(key);
        let _lock = file.write();

        let key_path = self.key_to_fspath(key);
        // A directory in the way of the key is replaced
        if key_path.is_dir() {
            std::fs::remove_dir_all(&key_path)?;
        }
        let parent = key_path
            .parent()
            .ok_or_else(|| StorageError::Other(format!("{} has no parent", key_path.display())))?;
        std::fs::create_dir_all(parent)?;

        if self.options.atomic_write {
            let temp_prefix = format!("{}.", key.file_name());
            let mut builder = tempfile::Builder::new();
            builder.prefix(&temp_prefix).suffix(PARTIAL_SUFFIX);
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                builder.permissions(std::fs::Permissions::from_mode(0o644));
            }
            let mut temp = builder.tempfile_in(parent)?;
            temp.write_all(value)?;
            temp.persist(&key_path).map_err(|err| err.error)?;
        } else {
            std::fs::write(&key_path, value)?;
        }
        Ok(())
    }

    /// Remove every empty directory below `prefix`, deepest first.
    ///
    /// The directory of `prefix` itself is kept.
    /// A directory that is no longer empty when it is removed (e.g. a concurrent writer repopulated it) is skipped.
    ///
    /// Returns the removed directories.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store is read only or a directory cannot be removed for any other reason.
    pub fn prune_empty_directories(
        &self,
        prefix: &StorePrefix,
    ) -> Result<Vec<PathBuf>, StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let mut removed = Vec::new();
        let directories = WalkDir::new(self.prefix_to_fs_path(prefix))
            .min_depth(1)
            .contents_first(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir());
        for directory in directories {
            let path = directory.path();
            match std::fs::remove_dir(path) {
                Ok(()) => {
                    log::debug!("removed empty directory {}", path.display());
                    removed.push(path.to_path_buf());
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    let repopulated = std::fs::read_dir(path)
                        .map(|mut entries| entries.next().is_some())
                        .unwrap_or(false);
                    if !repopulated {
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(removed)
    }

    fn walk_keys(&self, path: &Path) -> StoreKeys {
        WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
            .filter(|v| v.file_type().is_file())
            .filter(|v| !is_partial_file(&v.file_name().to_string_lossy()))
            .filter_map(|v| self.fspath_to_key(v.path()).ok())
            .collect()
    }
}

impl ReadableStorageTraits for FilesystemStore {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let file = self.get_file_mutex(key);
        let _lock = file.read();
        match std::fs::read(self.key_to_fspath(key)) {
            Ok(value) => Ok(Some(Bytes::from(value))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) if self.key_to_fspath(key).is_dir() => {
                log::debug!("{key} is a directory: {err}");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        let key_path = self.key_to_fspath(key);
        Ok(std::fs::metadata(key_path)
            .ok()
            .filter(std::fs::Metadata::is_file)
            .map(|metadata| metadata.len()))
    }
}

impl WritableStorageTraits for FilesystemStore {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        if self.readonly {
            Err(StorageError::ReadOnly)
        } else {
            self.set_impl(key, &value)
        }
    }

    fn erase(&self, key: &StoreKey) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let file = self.get_file_mutex(key);
        let _lock = file.write();

        let key_path = self.key_to_fspath(key);
        match std::fs::remove_file(key_path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn erase_prefix(&self, prefix: &StorePrefix) -> Result<(), StorageError> {
        if self.readonly {
            return Err(StorageError::ReadOnly);
        }

        let _lock = self.files.lock(); // lock all operations

        let prefix_path = self.prefix_to_fs_path(prefix);
        match std::fs::remove_dir_all(prefix_path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

impl ListableStorageTraits for FilesystemStore {
    fn list(&self) -> Result<StoreKeys, StorageError> {
        Ok(self.walk_keys(&self.base_path))
    }

    fn list_prefix(&self, prefix: &StorePrefix) -> Result<StoreKeys, StorageError> {
        Ok(self.walk_keys(&self.prefix_to_fs_path(prefix)))
    }

    fn list_dir(&self, prefix: &StorePrefix) -> Result<StoreKeysPrefixes, StorageError> {
        let prefix_path = self.prefix_to_fs_path(prefix);
        let mut keys: StoreKeys = vec![];
        let mut prefixes: StorePrefixes = vec![];
        if let Ok(dir) = std::fs::read_dir(prefix_path) {
            for entry in dir {
                let entry = entry?;
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    log::warn!("ignoring non UTF-8 path {}", entry.path().display());
                    continue;
                };
                if entry.file_type()?.is_dir() {
                    prefixes.push(StorePrefix::new(
                        prefix.as_str().to_string() + &name + "/",
                    )?);
                } else if !is_partial_file(&name) {
                    keys.push(StoreKey::new(prefix.as_str().to_string() + &name)?);
                }
            }
        }
        if self.sort {
            keys.sort();
            prefixes.sort();
        }

        Ok(StoreKeysPrefixes::new(keys, prefixes))
    }

    fn size_prefix(&self, prefix: &StorePrefix) -> Result<u64, StorageError> {
        let mut size = 0;
        for key in self.list_prefix(prefix)? {
            if let Some(size_key) = self.size_key(&key)? {
                size += size_key;
            }
        }
        Ok(size)
    }
}

/// A filesystem store creation error.
#[derive(Debug, Error)]
pub enum FilesystemStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The path is not valid on this system.
    #[error("base path {0} is not valid")]
    InvalidBasePath(PathBuf),
    /// The path exists and is not a directory.
    #[error("base path {0} exists and is not a directory")]
    NotADirectory(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_to_path_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?;
        let key = StoreKey::new("array/0/1/2")?;
        let fspath = store.key_to_fspath(&key);
        assert_eq!(fspath, path.path().join("array").join("0").join("1").join("2"));
        assert_eq!(store.fspath_to_key(&fspath)?, key);
        Ok(())
    }

    #[test]
    fn partial_files_are_hidden() -> Result<(), Box<dyn std::error::Error>> {
        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?;
        store.set(&"a/b".try_into()?, Bytes::from_static(b"x"))?;
        std::fs::write(path.path().join("a").join("b.123.partial"), b"torn")?;
        assert_eq!(store.list()?, vec![StoreKey::new("a/b")?]);
        assert_eq!(store.list_dir(&"a/".try_into()?)?.keys(), &[StoreKey::new("a/b")?]);
        Ok(())
    }

    #[test]
    fn prune_keeps_populated_directories() -> Result<(), Box<dyn std::error::Error>> {
        let path = tempfile::TempDir::new()?;
        let store = FilesystemStore::new(path.path())?;
        store.set(&"a/0/0/0".try_into()?, Bytes::from_static(b"x"))?;
        store.set(&"a/1/0/0".try_into()?, Bytes::from_static(b"y"))?;
        store.erase(&"a/0/0/0".try_into()?)?;

        let removed = store.prune_empty_directories(&"a/".try_into()?)?;
        assert_eq!(removed.len(), 2);
        assert!(!path.path().join("a/0").exists());
        assert!(path.path().join("a/1/0/0").is_file());
        assert!(path.path().join("a").is_dir());
        Ok(())
    }
}
