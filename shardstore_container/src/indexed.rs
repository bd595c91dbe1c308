//! The random access container.
//!
//! An indexed container is a single log-structured file:
//!
//! ```text
//! signature (8 bytes) | record | record | ...
//! record = magic u32 | kind u8 | name_len u32 | value_len u64 | crc32c u32 | name | value
//! ```
//!
//! Integers are little endian. The checksum covers the name and the value.
//! A `put` record creates or replaces a member and a `delete` record removes it.
//! The member index is rebuilt from the record headers when the container is opened, and the last record for a name wins.
//! A record extending beyond the end of the file (a torn append) is ignored and truncated by the next write.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use shardstore_storage::Bytes;

use crate::{
    temporary_file_beside, validate_member, Container, ContainerBackend, ContainerError,
    ContainerKind,
};

const SIGNATURE: &[u8; 8] = b"SHRDIDX\x01";
const RECORD_MAGIC: u32 = 0x5244_4853;
const RECORD_HEADER_SIZE: usize = 21;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Put,
    Delete,
}

impl RecordKind {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Put => 1,
            Self::Delete => 2,
        }
    }

    const fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(Self::Put),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    kind: RecordKind,
    name_len: u32,
    value_len: u64,
    crc: u32,
}

impl RecordHeader {
    fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut bytes = [0; RECORD_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        bytes[4] = self.kind.to_u8();
        bytes[5..9].copy_from_slice(&self.name_len.to_le_bytes());
        bytes[9..17].copy_from_slice(&self.value_len.to_le_bytes());
        bytes[17..21].copy_from_slice(&self.crc.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; RECORD_HEADER_SIZE]) -> Result<Self, String> {
        let le_u32 = |range: std::ops::Range<usize>| {
            let mut word = [0; 4];
            word.copy_from_slice(&bytes[range]);
            u32::from_le_bytes(word)
        };
        let magic = le_u32(0..4);
        if magic != RECORD_MAGIC {
            return Err(format!("invalid record magic {magic:#010x}"));
        }
        let kind = RecordKind::from_u8(bytes[4])
            .ok_or_else(|| format!("invalid record kind {}", bytes[4]))?;
        let mut value_len = [0; 8];
        value_len.copy_from_slice(&bytes[9..17]);
        Ok(Self {
            kind,
            name_len: le_u32(5..9),
            value_len: u64::from_le_bytes(value_len),
            crc: le_u32(17..21),
        })
    }

    /// The total length of the record, or [`None`] on overflow.
    fn record_len(&self) -> Option<u64> {
        (RECORD_HEADER_SIZE as u64)
            .checked_add(u64::from(self.name_len))?
            .checked_add(self.value_len)
    }
}

#[derive(Debug, Clone, Copy)]
struct MemberRecord {
    offset: u64,
    header: RecordHeader,
}

struct ScannedIndex {
    index: BTreeMap<String, MemberRecord>,
    valid_len: u64,
    file_len: u64,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> ContainerError {
    ContainerError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Rebuild the member index from the record headers of `file`.
fn scan(path: &Path, file: &File) -> Result<ScannedIndex, ContainerError> {
    let file_len = file.metadata()?.len();
    let mut index = BTreeMap::new();
    if file_len == 0 {
        // Created but not yet initialised.
        return Ok(ScannedIndex {
            index,
            valid_len: 0,
            file_len,
        });
    }

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(0))?;
    let mut signature = [0; SIGNATURE.len()];
    if file_len < SIGNATURE.len() as u64 || {
        reader.read_exact(&mut signature)?;
        signature != *SIGNATURE
    } {
        return Err(corrupt(path, "invalid container signature"));
    }

    let mut offset = SIGNATURE.len() as u64;
    let mut header_bytes = [0; RECORD_HEADER_SIZE];
    while offset < file_len {
        let remaining = file_len - offset;
        if remaining < RECORD_HEADER_SIZE as u64 {
            break;
        }
        reader.read_exact(&mut header_bytes)?;
        let header = RecordHeader::decode(&header_bytes)
            .map_err(|reason| corrupt(path, format!("{reason} at offset {offset}")))?;
        let record_len = header
            .record_len()
            .ok_or_else(|| corrupt(path, format!("invalid record length at offset {offset}")))?;
        if record_len > remaining {
            break;
        }
        let mut name = vec![0; header.name_len as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| corrupt(path, format!("invalid member name at offset {offset}")))?;
        let value_len = i64::try_from(header.value_len)
            .map_err(|_| corrupt(path, format!("invalid record length at offset {offset}")))?;
        reader.seek_relative(value_len)?;
        match header.kind {
            RecordKind::Put => {
                index.insert(name, MemberRecord { offset, header });
            }
            RecordKind::Delete => {
                index.remove(&name);
            }
        }
        offset += record_len;
    }

    if offset < file_len {
        log::warn!(
            "ignoring {} bytes of torn record at offset {offset} in container {}",
            file_len - offset,
            path.display()
        );
    }

    Ok(ScannedIndex {
        index,
        valid_len: offset,
        file_len,
    })
}

/// Read the name and value of `record` and verify its checksum.
///
/// Returns the concatenated name and value.
fn read_record(
    path: &Path,
    file: &mut File,
    member: &str,
    record: &MemberRecord,
) -> Result<Vec<u8>, ContainerError> {
    let name_len = record.header.name_len as usize;
    let value_len = usize::try_from(record.header.value_len)
        .map_err(|_| corrupt(path, format!("member {member} is too large")))?;
    let mut bytes = vec![0; name_len + value_len];
    file.seek(SeekFrom::Start(record.offset + RECORD_HEADER_SIZE as u64))?;
    file.read_exact(&mut bytes)?;
    if &bytes[..name_len] != member.as_bytes() || crc32c::crc32c(&bytes) != record.header.crc {
        return Err(corrupt(path, format!("checksum mismatch for member {member}")));
    }
    Ok(bytes)
}

/// A random access container backed by a single log-structured file.
///
/// The file holds a signature followed by `put` and `delete` records, each with a crc32c checksum over the member name and value.
/// Replaced and deleted members occupy space until [`IndexedContainer::compact`] is called.
#[derive(Debug)]
pub struct IndexedContainer {
    path: PathBuf,
    file: File,
    writable: bool,
    index: BTreeMap<String, MemberRecord>,
    valid_len: u64,
    file_len: u64,
    dirty: bool,
}

impl IndexedContainer {
    /// Open the container at `path` for reading and writing, creating it if it does not exist.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the file cannot be opened or is not a valid container.
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut container = Self::from_file(path, file, true)?;
        if container.file_len == 0 {
            container.file.write_all(SIGNATURE)?;
            container.valid_len = SIGNATURE.len() as u64;
            container.file_len = container.valid_len;
            container.dirty = true;
        }
        Ok(container)
    }

    /// Open the container at `path` for reading.
    ///
    /// Returns [`None`] if there is no file at `path`.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the file cannot be opened or is not a valid container.
    pub fn open_read(path: &Path) -> Result<Option<Self>, ContainerError> {
        match File::open(path) {
            Ok(file) => Ok(Some(Self::from_file(path, file, false)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn from_file(path: &Path, file: File, writable: bool) -> Result<Self, ContainerError> {
        let ScannedIndex {
            index,
            valid_len,
            file_len,
        } = scan(path, &file)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            writable,
            index,
            valid_len,
            file_len,
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

    /// The number of bytes held by live records.
    fn live_len(&self) -> u64 {
        self.index
            .values()
            .filter_map(|record| record.header.record_len())
            .sum()
    }

    fn append(&mut self, kind: RecordKind, member: &str, value: &[u8]) -> Result<(), ContainerError> {
        self.ensure_writable()?;
        if self.file_len > self.valid_len {
            log::warn!(
                "truncating torn record at offset {} in container {}",
                self.valid_len,
                self.path.display()
            );
            self.file.set_len(self.valid_len)?;
            self.file_len = self.valid_len;
        }

        let header = RecordHeader {
            kind,
            name_len: u32::try_from(member.len())
                .map_err(|_| ContainerError::InvalidMemberName(member.to_string()))?,
            value_len: value.len() as u64,
            crc: crc32c::crc32c_append(crc32c::crc32c(member.as_bytes()), value),
        };
        let record_len = header
            .record_len()
            .ok_or_else(|| corrupt(&self.path, "record too large"))?;
        let offset = self.valid_len;
        let mut head = Vec::with_capacity(RECORD_HEADER_SIZE + member.len());
        head.extend_from_slice(&header.encode());
        head.extend_from_slice(member.as_bytes());

        self.file.seek(SeekFrom::Start(offset))?;
        // Anything past valid_len is discarded by the next append if this write fails part way.
        self.file_len = offset + record_len;
        self.file.write_all(&head)?;
        self.file.write_all(value)?;
        self.valid_len = self.file_len;
        self.dirty = true;

        match kind {
            RecordKind::Put => {
                self.index
                    .insert(member.to_string(), MemberRecord { offset, header });
            }
            RecordKind::Delete => {
                self.index.remove(member);
            }
        }
        Ok(())
    }

    /// Rewrite the container with only its live records.
    ///
    /// The live records are written to a temporary file beside the container, which then atomically replaces it.
    /// Returns the number of bytes reclaimed.
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the container is read only, a live record fails verification, or there is an IO error.
    pub fn compact(&mut self) -> Result<u64, ContainerError> {
        self.ensure_writable()?;
        let compacted_len = SIGNATURE.len() as u64 + self.live_len();
        if compacted_len >= self.file_len {
            return Ok(0);
        }

        let mut temp = temporary_file_beside(&self.path)?;

        let mut index = BTreeMap::new();
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            writer.write_all(SIGNATURE)?;
            let mut offset = SIGNATURE.len() as u64;
            for (member, record) in &self.index {
                let bytes = read_record(&self.path, &mut self.file, member, record)?;
                writer.write_all(&record.header.encode())?;
                writer.write_all(&bytes)?;
                index.insert(
                    member.clone(),
                    MemberRecord {
                        offset,
                        header: record.header,
                    },
                );
                offset += RECORD_HEADER_SIZE as u64 + bytes.len() as u64;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        let file = temp.persist(&self.path).map_err(|err| err.error)?;

        let reclaimed = self.file_len - compacted_len;
        log::debug!(
            "compacted container {}, reclaimed {reclaimed} bytes",
            self.path.display()
        );
        self.file = file;
        self.index = index;
        self.valid_len = compacted_len;
        self.file_len = compacted_len;
        self.dirty = false;
        Ok(reclaimed)
    }
}

impl Container for IndexedContainer {
    fn path(&self) -> &Path {
        &self.path
    }

    fn read(&mut self, member: &str) -> Result<Option<Bytes>, ContainerError> {
        let Some(record) = self.index.get(member).copied() else {
            return Ok(None);
        };
        let mut bytes = Bytes::from(read_record(&self.path, &mut self.file, member, &record)?);
        Ok(Some(bytes.split_off(member.len())))
    }

    fn size_member(&self, member: &str) -> Option<u64> {
        self.index.get(member).map(|record| record.header.value_len)
    }

    fn members(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    fn write(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError> {
        validate_member(member)?;
        self.append(RecordKind::Put, member, value)
    }

    fn rewrite(&mut self, member: &str, value: &[u8]) -> Result<(), ContainerError> {
        self.write(member, value)
    }

    fn delete(&mut self, member: &str) -> Result<(), ContainerError> {
        if self.index.contains_key(member) {
            self.append(RecordKind::Delete, member, &[])
        } else {
            Ok(())
        }
    }

    fn sync(&mut self) -> Result<(), ContainerError> {
        if self.dirty {
            self.file.sync_data()?;
            self.dirty = false;
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<u64, ContainerError> {
        IndexedContainer::compact(self)
    }
}

/// A [`ContainerBackend`] for [`IndexedContainer`]s.
#[derive(Debug, Clone)]
pub struct IndexedContainerBackend {
    extension: String,
}

impl IndexedContainerBackend {
    /// The default extension of indexed containers.
    pub const DEFAULT_EXTENSION: &'static str = ".shard";

    /// Create a new indexed container backend for files ending with `extension` (including the leading `.`).
    #[must_use]
    pub fn new(extension: String) -> Self {
        Self { extension }
    }
}

impl Default for IndexedContainerBackend {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EXTENSION.to_string())
    }
}

impl ContainerBackend for IndexedContainerBackend {
    fn kind(&self) -> ContainerKind {
        ContainerKind::RandomAccess
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Container>, ContainerError> {
        Ok(Box::new(IndexedContainer::open(path)?))
    }

    fn open_read(&self, path: &Path) -> Result<Option<Box<dyn Container>>, ContainerError> {
        Ok(IndexedContainer::open_read(path)?.map(|container| Box::new(container) as Box<dyn Container>))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_encoding() {
        let header = RecordHeader {
            kind: RecordKind::Delete,
            name_len: 3,
            value_len: 1 << 40,
            crc: 0xdead_beef,
        };
        let decoded = RecordHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.kind, RecordKind::Delete);
        assert_eq!(decoded.name_len, 3);
        assert_eq!(decoded.value_len, 1 << 40);
        assert_eq!(decoded.crc, 0xdead_beef);
        assert_eq!(decoded.record_len(), Some(24 + (1 << 40)));

        let mut bytes = header.encode();
        bytes[4] = 9;
        assert!(RecordHeader::decode(&bytes).is_err());
        bytes[0] = 0;
        assert!(RecordHeader::decode(&bytes).is_err());
    }

    #[test]
    fn indexed_last_record_wins() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("a/0.shard");
        let mut container = IndexedContainer::open(&path)?;
        container.write("0/0", &[1, 2])?;
        container.write("0/1", &[3])?;
        container.write("0/0", &[4, 5, 6])?;
        container.delete("0/1")?;
        container.delete("0/1")?;
        container.sync()?;
        drop(container);

        let mut container = IndexedContainer::open_read(&path)?.unwrap();
        assert_eq!(container.members(), ["0/0"]);
        assert_eq!(container.read("0/0")?.unwrap().as_ref(), [4, 5, 6]);
        assert_eq!(container.read("0/1")?, None);
        assert_eq!(container.size_member("0/0"), Some(3));
        assert!(matches!(
            container.write("0/2", &[]),
            Err(ContainerError::ReadOnly(_))
        ));
        Ok(())
    }

    #[test]
    fn indexed_open_read_missing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        assert!(IndexedContainer::open_read(&dir.path().join("0.shard"))?.is_none());
        assert!(!dir.path().join("0.shard").exists());
        Ok(())
    }

    #[test]
    fn indexed_invalid_member() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::TempDir::new()?;
        let mut container = IndexedContainer::open(&dir.path().join("0.shard"))?;
        assert!(matches!(
            container.write("a//b", &[]),
            Err(ContainerError::InvalidMemberName(_))
        ));
        Ok(())
    }
}
