//! Shard containers for the [`shardstore`](https://docs.rs/shardstore) crates.
//!
//! A container is a single physical file holding many members, each member being the payload of one store key.
//! Two container kinds are supported:
//! - [`IndexedContainer`] (random access): members are independently created, replaced, and deleted.
//! - [`ZipArchiveContainer`] (archive): append-only; replacing or removing a member rewrites the whole archive.
//!
//! Containers are opened through a [`ContainerBackend`], which fixes the container kind and file extension.
//!
//! ## Licence
//! `shardstore_container` is licensed under either of
//! - the Apache License, Version 2.0 <http://www.apache.org/licenses/LICENSE-2.0> or
//! - the MIT license <http://opensource.org/licenses/MIT>, at your option.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod archive;
mod indexed;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shardstore_storage::{Bytes, StorageError};
use thiserror::Error;

pub use archive::{ZipArchiveBackend, ZipArchiveContainer};
pub use indexed::{IndexedContainer, IndexedContainerBackend};

/// The suffix of temporary files written beside a container while it is rewritten.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// The kind of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    /// A mutable container supporting independent member create, update, and delete.
    #[default]
    RandomAccess,
    /// An append-only archive. Replacing or removing a member requires a full rewrite.
    Archive,
}

impl ContainerKind {
    /// The default file extension of containers of this kind.
    #[must_use]
    pub const fn default_extension(self) -> &'static str {
        match self {
            Self::RandomAccess => IndexedContainerBackend::DEFAULT_EXTENSION,
            Self::Archive => ZipArchiveBackend::DEFAULT_EXTENSION,
        }
    }

    /// Create a backend for this kind of container with `extension`.
    ///
    /// # Errors
    /// Returns [`ContainerError::InvalidExtension`] if `extension` is not a valid container extension.
    pub fn backend(self, extension: &str) -> Result<Arc<dyn ContainerBackend>, ContainerError> {
        let extension = normalize_extension(extension)?;
        Ok(match self {
            Self::RandomAccess => Arc::new(IndexedContainerBackend::new(extension)),
            Self::Archive => Arc::new(ZipArchiveBackend::new(extension)),
        })
    }
}

/// Normalise a container extension so that it starts with a single `.`.
fn normalize_extension(extension: &str) -> Result<String, ContainerError> {
    let stem = extension.strip_prefix('.').unwrap_or(extension);
    if stem.is_empty() || stem.contains(['/', '\\']) || stem.starts_with('.') {
        Err(ContainerError::InvalidExtension(extension.to_string()))
    } else {
        Ok(format!(".{stem}"))
    }
}

/// A container error.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The container at `path` could not be parsed.
    #[error("container {path} is corrupt: {reason}")]
    Corrupt {
        /// The path of the container.
        path: PathBuf,
        /// Why the container could not be read.
        reason: String,
    },
    /// An archive member was written again without a full rewrite.
    #[error("member {member} already exists in archive {path}")]
    ArchiveMemberExists {
        /// The path of the archive.
        path: PathBuf,
        /// The member name.
        member: String,
    },
    /// A member read back after writing did not match the written value.
    #[error("member {member} of container {path} did not match the written value")]
    VerificationFailed {
        /// The path of the container.
        path: PathBuf,
        /// The member name.
        member: String,
    },
    /// A write was attempted on a container opened for reading.
    #[error("container {0} is open for reading only")]
    ReadOnly(PathBuf),
    /// A member name is not valid.
    #[error("invalid member name {0}")]
    InvalidMemberName(String),
    /// A container extension is not valid.
    #[error("invalid container extension {0}")]
    InvalidExtension(String),
}

impl From<ContainerError> for StorageError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::IOError(err) => err.into(),
            ContainerError::Corrupt { path, reason } => Self::ContainerCorrupt { path, reason },
            ContainerError::ArchiveMemberExists { path, member } => {
                Self::ArchiveMemberExists { path, member }
            }
            ContainerError::ReadOnly(_) => Self::ReadOnly,
            err @ (ContainerError::VerificationFailed { .. }
            | ContainerError::InvalidMemberName(_)
            | ContainerError::InvalidExtension(_)) => Self::Other(err.to_string()),
        }
    }
}

/// The immediate children of a prefix within a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerListing {
    /// Members that are direct children of the prefix (full member names).
    pub members: Vec<String>,
    /// Sub-prefixes that are direct children of the prefix (full prefixes, `/` terminated).
    pub prefixes: Vec<String>,
}

/// List the immediate children of `prefix` amongst `members`.
///
/// `prefix` is either empty or `/` terminated.
pub(crate) fn list_children<'a>(
    members: impl Iterator<Item = &'a str>,
    prefix: &str,
) -> ContainerListing {
    let mut direct = BTreeSet::new();
    let mut prefixes = BTreeSet::new();
    for member in members {
        let Some(rest) = member.strip_prefix(prefix) else {
            continue;
        };
        match rest.split_once('/') {
            Some((child, _)) => {
                prefixes.insert(format!("{prefix}{child}/"));
            }
            None if !rest.is_empty() => {
                direct.insert(member.to_string());
            }
            None => {}
        }
    }
    ContainerListing {
        members: direct.into_iter().collect(),
        prefixes: prefixes.into_iter().collect(),
    }
}

/// Validate a member name.
///
/// Member names follow the same rules as store keys.
pub(crate) fn validate_member(member: &str) -> Result<(), ContainerError> {
    if shardstore_storage::StoreKey::validate(member) {
        Ok(())
    } else {
        Err(ContainerError::InvalidMemberName(member.to_string()))
    }
}

/// Create a temporary `.partial` file in the directory of `path`, to be persisted over `path`.
pub(crate) fn temporary_file_beside(path: &Path) -> Result<tempfile::NamedTempFile, ContainerError> {
    let parent = path.parent().ok_or_else(|| ContainerError::Corrupt {
        path: path.to_path_buf(),
        reason: "container has no parent directory".to_string(),
    })?;
    let temp_prefix = format!(
        "{}.",
        path.file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default()
    );
    let mut builder = tempfile::Builder::new();
    builder.prefix(&temp_prefix).suffix(PARTIAL_SUFFIX);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o644));
    }
    Ok(builder.tempfile_in(parent)?)
}

/// An open container.
///
/// Exclusive write access to a container file is the responsibility of the caller.
pub trait Container: Send + std::fmt::Debug {
    /// The path of the container file.
    fn path(&self) -> &Path;

    /// Read the member `member`.
    ///
    /// Returns [`None`] if the container does not hold `member`.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the member cannot be read or fails verification.
    fn read(&mut self, member: &str) -> Result<Option<Bytes>, ContainerError>;

    /// Returns the size in bytes of `member`, or [`None`] if the container does not hold it.
    fn size_member(&self, member: &str) -> Option<u64>;

    /// Returns true if the container holds `member`.
    fn contains(&self, member: &str) -> bool {
        self.size_member(member).is_some()
    }

    /// Returns the names of all members, sorted.
    fn members(&self) -> Vec<String>;

    /// List the immediate children of `prefix` (empty or `/` terminated).
    fn list(&self, prefix: &str) -> ContainerListing {
        let members = self.members();
        list_children(members.iter().map(String::as_str), prefix)
    }

    /// Write `value` to `member`, creating or replacing it.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] on failure, including [`ContainerError::ArchiveMemberExists`] if the container is an archive already holding `member`.
    fn write(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError>;

    /// Write `value` to `member`, rewriting the whole container if needed to replace an existing member.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] on failure.
    fn rewrite(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError>;

    /// Delete `member`. Deleting an absent member is not an error.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] on failure.
    fn delete(&mut self, member: &str) -> Result<(), ContainerError>;

    /// Flush all writes to durable storage.
    ///
    /// A member is durable once `sync` returns successfully after it was written.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] on failure.
    fn sync(&mut self) -> Result<(), ContainerError>;

    /// Reclaim space held by replaced or deleted members.
    ///
    /// Returns the number of bytes reclaimed.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] on failure.
    fn compact(&mut self) -> Result<u64, ContainerError> {
        Ok(0)
    }

    /// Sync and close the container.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the final sync fails.
    fn close(mut self: Box<Self>) -> Result<(), ContainerError> {
        self.sync()
    }
}

/// A container backend.
///
/// A backend opens containers of one [`ContainerKind`] whose file names end with [`ContainerBackend::extension`].
pub trait ContainerBackend: Send + Sync + std::fmt::Debug {
    /// The kind of containers opened by this backend.
    fn kind(&self) -> ContainerKind;

    /// The container file extension, including the leading `.`.
    fn extension(&self) -> &str;

    /// Open the container at `path` for reading and writing, creating it (and its parent directories) if absent.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the container cannot be created or is corrupt.
    fn open(&self, path: &Path) -> Result<Box<dyn Container>, ContainerError>;

    /// Open the container at `path` for reading.
    ///
    /// Returns [`None`] if there is no container at `path`. Never creates a container.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the container cannot be read or is corrupt.
    fn open_read(&self, path: &Path) -> Result<Option<Box<dyn Container>>, ContainerError>;

    /// Returns true if `path` names a container of this backend.
    fn is_container_path(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(self.extension()))
            .is_some_and(|stem| !stem.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_extension() {
        assert_eq!(normalize_extension("shard").unwrap(), ".shard");
        assert_eq!(normalize_extension(".zip").unwrap(), ".zip");
        assert!(normalize_extension("").is_err());
        assert!(normalize_extension(".").is_err());
        assert!(normalize_extension("a/b").is_err());
        assert!(normalize_extension("..zip").is_err());
        assert_eq!(ContainerKind::Archive.default_extension(), ".zip");
        assert_eq!(ContainerKind::default(), ContainerKind::RandomAccess);
    }

    #[test]
    fn container_kind_serde() {
        let kind: ContainerKind = serde_json::from_str(r#""random_access""#).unwrap();
        assert_eq!(kind, ContainerKind::RandomAccess);
        let kind: ContainerKind = serde_json::from_str(r#""archive""#).unwrap();
        assert_eq!(kind, ContainerKind::Archive);
    }

    #[test]
    fn container_list_children() {
        let members = ["0/0", "0/1", "1/0", "2", "1/1/x"];
        let listing = list_children(members.into_iter(), "");
        assert_eq!(listing.members, ["2"]);
        assert_eq!(listing.prefixes, ["0/", "1/"]);
        let listing = list_children(members.into_iter(), "1/");
        assert_eq!(listing.members, ["1/0"]);
        assert_eq!(listing.prefixes, ["1/1/"]);
        assert_eq!(
            list_children(members.into_iter(), "3/"),
            ContainerListing::default()
        );
    }

    #[test]
    fn container_path_detection() {
        let backend = ContainerKind::RandomAccess
            .backend(ContainerKind::RandomAccess.default_extension())
            .unwrap();
        assert!(backend.is_container_path(Path::new("a/0.shard")));
        assert!(!backend.is_container_path(Path::new("a/.shard")));
        assert!(!backend.is_container_path(Path::new("a/0.zip")));
    }
}
