//! The storage API for the [`shardstore`](https://docs.rs/shardstore) crates.
//!
//! A store is a system that can be used to store and retrieve the values of a chunked array hierarchy.
//! Values are opaque byte payloads addressed by `/` separated [`StoreKey`]s.
//! The array library that consumes a store owns the meaning of every key and value; a store only persists bytes.
//!
//! This crate defines the store traits ([`ReadableStorageTraits`], [`WritableStorageTraits`], [`ListableStorageTraits`]),
//! key and prefix types, the [`StorageError`] returned by every store, and an in-memory store.
//!
//! ## Licence
//! `shardstore_storage` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod storage_sync;
pub mod store;
mod store_key;
mod store_prefix;


use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub use store_key::{StoreKey, StoreKeyError, StoreKeys};
pub use store_prefix::{StorePrefix, StorePrefixError, StorePrefixes};

pub use self::storage_sync::{
    ListableStorageTraits, ReadableListableStorageTraits, ReadableStorageTraits,
    ReadableWritableListableStorageTraits, ReadableWritableStorageTraits, WritableStorageTraits,
};

/// [`Arc`] wrapped readable storage.
pub type ReadableStorage = Arc<dyn ReadableStorageTraits>;

/// [`Arc`] wrapped writable storage.
pub type WritableStorage = Arc<dyn WritableStorageTraits>;

/// [`Arc`] wrapped readable and writable storage.
pub type ReadableWritableStorage = Arc<dyn ReadableWritableStorageTraits>;

/// [`Arc`] wrapped listable storage.
pub type ListableStorage = Arc<dyn ListableStorageTraits>;

/// [`Arc`] wrapped readable, writable, and listable storage.
pub type ReadableWritableListableStorage = Arc<dyn ReadableWritableListableStorageTraits>;

/// The type for bytes used in store set and get methods.
///
/// An alias for [`bytes::Bytes`].
pub type Bytes = bytes::Bytes;

/// An alias for bytes which may or may not be available.
///
/// When a value is read from a store, it returns `MaybeBytes` which is [`None`] if the key is not available.
pub type MaybeBytes = Option<Bytes>;

/// [`StoreKeys`] and [`StorePrefixes`].
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct StoreKeysPrefixes {
    keys: StoreKeys,
    prefixes: StorePrefixes,
}

impl StoreKeysPrefixes {
    /// Create a new [`StoreKeysPrefixes`].
    #[must_use]
    pub fn new(keys: StoreKeys, prefixes: StorePrefixes) -> Self {
        Self { keys, prefixes }
    }

    /// Returns the keys.
    #[must_use]
    pub const fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Returns the prefixes.
    #[must_use]
    pub const fn prefixes(&self) -> &StorePrefixes {
        &self.prefixes
    }
}

/// A storage error.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// A write operation was attempted on a read only store.
    #[error("a write operation was attempted on a read only store")]
    ReadOnly,
    /// An operation was attempted on a closed store.
    #[error("the store is closed")]
    Closed,
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] Arc<std::io::Error>),
    /// An invalid store prefix.
    #[error("invalid store prefix {0}")]
    StorePrefixError(#[from] StorePrefixError),
    /// An invalid store key.
    #[error("invalid store key {0}")]
    InvalidStoreKey(#[from] StoreKeyError),
    /// A container file could not be read or parsed.
    ///
    /// Only the container at `path` is affected.
    #[error("container {path} is corrupt: {reason}")]
    ContainerCorrupt {
        /// The path of the container.
        path: PathBuf,
        /// Why the container could not be read.
        reason: String,
    },
    /// A member of an append-only archive container was written again without a full rewrite.
    #[error("member {member} already exists in archive {path}")]
    ArchiveMemberExists {
        /// The path of the archive.
        path: PathBuf,
        /// The member name.
        member: String,
    },
    /// A lock could not be acquired before its timeout elapsed.
    ///
    /// The operation did not proceed and can be retried.
    #[error("timed out acquiring lock {0}")]
    LockTimeout(String),
    /// The lock service could not be reached.
    #[error("lock {0} is unavailable: {1}")]
    LockUnavailable(String, String),
    /// The requested method is not supported.
    #[error("{0}")]
    Unsupported(String),
    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Returns true if the operation that produced this error can be retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::LockUnavailable(..))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

impl From<&str> for StorageError {
    fn from(err: &str) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<String> for StorageError {
    fn from(err: String) -> Self {
        Self::Other(err)
    }
}
