use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use shardstore_storage::Bytes;
use zip::{result::ZipError, write::SimpleFileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    temporary_file_beside, validate_member, Container, ContainerBackend, ContainerError,
    ContainerKind,
};

fn zip_error(path: &Path, err: ZipError) -> ContainerError {
    match err {
        ZipError::Io(err) => ContainerError::IOError(err),
        err => ContainerError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        },
    }
}

fn file_options(len: usize) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(len as u64 >= u64::from(u32::MAX))
}

/// An append-only archive container backed by a zip file.
///
/// Members are stored uncompressed.
/// A new member is appended in place, but replacing or removing a member rebuilds the archive in a temporary file which then replaces the original.
#[derive(Debug)]
pub struct ZipArchiveContainer {
    path: PathBuf,
    writable: bool,
    members: BTreeMap<String, u64>,
    archive: Option<ZipArchive<File>>,
    dirty: bool,
}

impl ZipArchiveContainer {
    /// Open the archive at `path` for reading and writing, creating an empty archive if it does not exist.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the archive cannot be created or parsed.
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => {
                let file = ZipWriter::new(file)
                    .finish()
                    .map_err(|err| zip_error(path, err))?;
                file.sync_all()?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        Self::load(path, true)
    }

    /// Open the archive at `path` for reading.
    ///
    /// Returns [`None`] if there is no file at `path`.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the archive cannot be read or parsed.
    pub fn open_read(path: &Path) -> Result<Option<Self>, ContainerError> {
        match Self::load(path, false) {
            Ok(container) => Ok(Some(container)),
            Err(ContainerError::IOError(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn load(path: &Path, writable: bool) -> Result<Self, ContainerError> {
        let mut archive =
            ZipArchive::new(File::open(path)?).map_err(|err| zip_error(path, err))?;
        let mut members = BTreeMap::new();
        for index in 0..archive.len() {
            let file = archive
                .by_index_raw(index)
                .map_err(|err| zip_error(path, err))?;
            if !file.is_dir() {
                members.insert(file.name().to_string(), file.size());
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            writable,
            members,
            archive: Some(archive),
            dirty: false,
        })
    }

    fn ensure_writable(&self) -> Result<(), ContainerError> {
        if self.writable {
            Ok(())
        } else {
            Err(ContainerError::ReadOnly(self.path.clone()))
        }
    }

    fn archive(&mut self) -> Result<&mut ZipArchive<File>, ContainerError> {
        if self.archive.is_none() {
            let archive = ZipArchive::new(File::open(&self.path)?)
                .map_err(|err| zip_error(&self.path, err))?;
            self.archive = Some(archive);
        }
        self.archive
            .as_mut()
            .ok_or_else(|| ContainerError::Corrupt {
                path: self.path.clone(),
                reason: "archive is not open".to_string(),
            })
    }

    /// Append `member` to the end of the archive.
    fn append(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError> {
        self.archive = None;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = ZipWriter::new_append(file).map_err(|err| zip_error(&self.path, err))?;
        writer
            .start_file(member, file_options(value.len()))
            .map_err(|err| zip_error(&self.path, err))?;
        writer.write_all(value)?;
        writer.finish().map_err(|err| zip_error(&self.path, err))?;
        self.members.insert(member.to_string(), value.len() as u64);
        self.dirty = true;
        Ok(())
    }

    /// Rebuild the archive without the current `member`, then with `value` for `member` if given.
    fn rebuild(&mut self, member: &str, value: Option<&[u8]>) -> Result<(), ContainerError> {
        self.archive = None;
        let mut temp = temporary_file_beside(&self.path)?;
        {
            let mut source =
                ZipArchive::new(File::open(&self.path)?).map_err(|err| zip_error(&self.path, err))?;
            let mut writer = ZipWriter::new(temp.as_file_mut());
            for index in 0..source.len() {
                let file = source
                    .by_index_raw(index)
                    .map_err(|err| zip_error(&self.path, err))?;
                if file.name() != member {
                    writer
                        .raw_copy_file(file)
                        .map_err(|err| zip_error(&self.path, err))?;
                }
            }
            if let Some(value) = value {
                writer
                    .start_file(member, file_options(value.len()))
                    .map_err(|err| zip_error(&self.path, err))?;
                writer.write_all(value)?;
            }
            writer.finish().map_err(|err| zip_error(&self.path, err))?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|err| err.error)?;
        log::debug!(
            "rewrote archive {} for member {member}",
            self.path.display()
        );

        if let Some(value) = value {
            self.members.insert(member.to_string(), value.len() as u64);
        } else {
            self.members.remove(member);
        }
        Ok(())
    }
}

impl Container for ZipArchiveContainer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, member: &str) -> Result<Option<Bytes>, ContainerError> {
        let Some(&size) = self.members.get(member) else {
            return Ok(None);
        };
        let path = self.path.clone();
        let archive = self.archive()?;
        let mut file = match archive.by_name(member) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(err) => return Err(zip_error(&path, err)),
        };
        let mut bytes = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
        file.read_to_end(&mut bytes).map_err(|err| {
            if err.kind() == std::io::ErrorKind::InvalidData {
                ContainerError::Corrupt {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            } else {
                ContainerError::IOError(err)
            }
        })?;
        Ok(Some(Bytes::from(bytes)))
    }

    fn size_member(&self, member: &str) -> Option<u64> {
        self.members.get(member).copied()
    }

    fn members(&self) -> Vec<String> {
        self.members.keys().cloned().collect()
    }

    fn write(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError> {
        validate_member(member)?;
        self.ensure_writable()?;
        if self.members.contains_key(member) {
            return Err(ContainerError::ArchiveMemberExists {
                path: self.path.clone(),
                member: member.to_string(),
            });
        }
        self.append(member, value)
    }

    fn rewrite(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError> {
        validate_member(member)?;
        self.ensure_writable()?;
        if self.members.contains_key(member) {
            self.rebuild(member, Some(value))
        } else {
            self.append(member, value)
        }
    }

    fn delete(&mut self, member: &str) -> Result<(), ContainerError> {
        if self.members.contains_key(member) {
            self.ensure_writable()?;
            self.rebuild(member, None)
        } else {
            Ok(())
        }
    }

    fn sync(&mut self) -> Result<(), ContainerError> {
        if self.dirty {
            File::open(&self.path)?.sync_all()?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// A [`ContainerBackend`] for [`ZipArchiveContainer`]s.
#[derive(Debug, Clone)]
pub struct ZipArchiveBackend {
    extension: String,
}

impl ZipArchiveBackend {
    /// The default extension of archive containers.
    pub const DEFAULT_EXTENSION: &'static str = ".zip";

    /// Create a new archive backend for files ending with `extension` (including the leading `.`).
    #[must_use]
    pub fn new(extension: String) -> Self {
        Self { extension }
    }
}

impl Default for ZipArchiveBackend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EXTENSION.to_string())
    }
}

impl ContainerBackend for ZipArchiveBackend {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Archive
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>, ContainerError> {
        Ok(Box::new(ZipArchiveContainer::open(path)?))
    }

    fn open_read(&self, path: &Path) -> Result<Option<Box<dyn Container>>, ContainerError> {
        Ok(ZipArchiveContainer::open_read(path)?
            .map(|container| Box::new(container) as Box<dyn Container>))
    }
}
