//! `shardstore` is a sharded nested directory store for chunked array hierarchies.
//!
//! Chunked array formats such as Zarr store every chunk as its own file.
//! Large arrays on shared filesystems end up with millions of small files, which is slow to list, copy and back up.
//! A [`ShardedStore`] groups the deepest levels of the key hierarchy into container files, so that the chunks `array/0/1/0` and `array/0/1/1` are members `1/0` and `1/1` of the container `array/0.shard` with the default shard depth of 3.
//!
//! Key features:
//! - Keys keep their nested directory names, and metadata documents (`zarr.json`, `.zarray`, ...) always stay loose files.
//! - Reads transparently fall back to the loose layout, so existing nested directory stores can be opened as is and migrated in place with [`ShardedStore::consolidate`].
//! - Two container kinds: a crash-safe random access container supporting in-place replacement and deletion, and a zip archive container readable by standard tools. See [`container`].
//! - Locking of container writes within a process or across processes and hosts. See [`lock`].
//! - Consolidation runs container groups in parallel on a [`rayon`] thread pool.
//!
//! ## Getting Started
//! ```rust
//! use shardstore::storage::{ListableStorageTraits, ReadableStorageTraits, StoreKey, WritableStorageTraits};
//! use shardstore::{ShardedStore, ShardedStoreOptions};
//!
//! # let dir = tempfile::TempDir::new()?;
//! let store = ShardedStore::open(dir.path(), ShardedStoreOptions::default())?;
//! let key = StoreKey::new("array/0/1/2")?;
//! store.set(&key, vec![1, 2, 3].into())?;
//! assert!(dir.path().join("array/0.shard").is_file());
//! assert_eq!(store.get(&key)?.as_deref(), Some([1u8, 2, 3].as_slice()));
//! assert_eq!(store.list()?, [key]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Crates
//! - [`shardstore_storage`] (re-exported as [`storage`]): the store traits, keys and prefixes, and the storage error.
//! - [`shardstore_filesystem`] (re-exported as [`filesystem`]): the loose nested directory store.
//! - [`shardstore_container`] (re-exported as [`container`]): the container formats.
//!
//! ## Licence
//! `shardstore` is licensed under either of
//!  - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//!  - the MIT license <http://opensource.org/licenses/MIT>, at your option.
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted for inclusion in the work by you, as defined in the Apache-2.0 license, shall be dual licensed as above, without any additional terms or conditions.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod consolidation;
pub mod key_mapper;
pub mod lock;
pub mod options;
mod sharded_store;
pub mod worker_pool;

pub use options::{ShardedStoreConfig, ShardedStoreOptions, DEFAULT_CONSOLIDATE_DEPTH};
pub use sharded_store::{ShardedStore, ShardedStoreCreateError};

pub use shardstore_container as container;
pub use shardstore_filesystem as filesystem;
pub use shardstore_storage as storage;
