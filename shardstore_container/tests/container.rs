#![allow(missing_docs)]

use std::error::Error;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use shardstore_container::{
    Container, ContainerError, ContainerKind, IndexedContainer, ZipArchiveContainer,
};

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[test]
fn indexed_torn_tail_is_ignored_and_truncated() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("0.shard");

    let mut container = IndexedContainer::open(&path)?;
    container.write("0/0", b"first")?;
    container.write("0/1", b"second")?;
    container.sync()?;
    let intact_len = file_len(&path);
    container.write("1/0", b"torn")?;
    Box::new(container).close()?;

    // Simulate a crash part way through the last append
    let file = OpenOptions::new().write(true).open(&path)?;
    file.set_len(file_len(&path) - 2)?;
    drop(file);

    let mut container = IndexedContainer::open_read(&path)?.unwrap();
    assert_eq!(container.members(), ["0/0", "0/1"]);
    assert_eq!(container.read("0/1")?.unwrap().as_ref(), b"second");
    assert_eq!(container.read("1/0")?, None);

    let mut container = IndexedContainer::open(&path)?;
    container.write("1/1", b"new")?;
    container.sync()?;
    assert_eq!(file_len(&path), intact_len + 21 + 3 + 3);

    let mut container = IndexedContainer::open_read(&path)?.unwrap();
    assert_eq!(container.members(), ["0/0", "0/1", "1/1"]);
    assert_eq!(container.read("1/1")?.unwrap().as_ref(), b"new");
    Ok(())
}

#[test]
fn indexed_checksum_mismatch_is_corrupt() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("0.shard");

    let mut container = IndexedContainer::open(&path)?;
    container.write("0/0", &[1, 2, 3])?;
    container.write("0/1", &[4, 5, 6])?;
    container.sync()?;
    drop(container);

    // Flip the final value byte of the last record
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
    file.seek(SeekFrom::End(-1))?;
    file.write_all(&[0xff])?;
    drop(file);

    let mut container = IndexedContainer::open_read(&path)?.unwrap();
    assert_eq!(container.read("0/0")?.unwrap().as_ref(), [1, 2, 3]);
    match container.read("0/1") {
        Err(ContainerError::Corrupt { path: corrupt_path, .. }) => assert_eq!(corrupt_path, path),
        result => panic!("expected a corrupt container, got {result:?}"),
    }
    Ok(())
}

#[test]
fn indexed_invalid_signature_is_corrupt() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("0.shard");
    std::fs::write(&path, b"not a container at all")?;
    assert!(matches!(
        IndexedContainer::open_read(&path),
        Err(ContainerError::Corrupt { .. })
    ));
    assert!(matches!(
        IndexedContainer::open(&path),
        Err(ContainerError::Corrupt { .. })
    ));
    Ok(())
}

#[test]
fn indexed_compaction() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("a/0.shard");

    let mut container = IndexedContainer::open(&path)?;
    for value in [[1; 100], [2; 100], [3; 100]] {
        container.write("0/0", &value)?;
    }
    container.write("0/1", &[4; 50])?;
    container.delete("0/1")?;
    let uncompacted_len = file_len(&path);
    assert_eq!(container.compact()?, uncompacted_len - (8 + 21 + 3 + 100));
    assert_eq!(file_len(&path), 8 + 21 + 3 + 100);
    assert_eq!(container.compact()?, 0);

    container.write("0/2", &[5])?;
    container.sync()?;
    drop(container);

    let mut container = IndexedContainer::open_read(&path)?.unwrap();
    assert_eq!(container.members(), ["0/0", "0/2"]);
    assert_eq!(container.read("0/0")?.unwrap().as_ref(), [3; 100]);
    assert_eq!(container.read("0/2")?.unwrap().as_ref(), [5]);

    // No temporary files are left behind
    assert_eq!(std::fs::read_dir(dir.path().join("a"))?.count(), 1);
    Ok(())
}

#[test]
fn archive_overwrite_requires_rewrite() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("0.zip");

    let mut container = ZipArchiveContainer::open(&path)?;
    container.write("0/0", &[1, 2])?;
    container.write("0/1", &[3])?;
    match container.write("0/0", &[9]) {
        Err(ContainerError::ArchiveMemberExists { member, .. }) => assert_eq!(member, "0/0"),
        result => panic!("expected an existing member, got {result:?}"),
    }
    assert_eq!(container.read("0/0")?.unwrap().as_ref(), [1, 2]);

    container.rewrite("0/0", &[7, 8, 9])?;
    assert_eq!(container.read("0/0")?.unwrap().as_ref(), [7, 8, 9]);
    assert_eq!(container.read("0/1")?.unwrap().as_ref(), [3]);

    container.delete("0/1")?;
    container.delete("0/1")?;
    container.sync()?;
    drop(container);

    let mut container = ZipArchiveContainer::open_read(&path)?.unwrap();
    assert_eq!(container.members(), ["0/0"]);
    assert_eq!(container.size_member("0/0"), Some(3));
    assert_eq!(container.read("0/0")?.unwrap().as_ref(), [7, 8, 9]);
    assert!(matches!(
        container.write("0/2", &[]),
        Err(ContainerError::ReadOnly(_))
    ));
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    Ok(())
}

#[test]
fn archive_unparseable_is_corrupt() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("0.zip");
    assert!(ZipArchiveContainer::open_read(&path)?.is_none());
    std::fs::write(&path, b"garbage")?;
    assert!(matches!(
        ZipArchiveContainer::open_read(&path),
        Err(ContainerError::Corrupt { .. })
    ));
    Ok(())
}

#[test]
fn backend_listing() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::TempDir::new()?;
    for kind in [ContainerKind::RandomAccess, ContainerKind::Archive] {
        let backend = kind.backend(kind.default_extension())?;
        assert_eq!(backend.kind(), kind);
        let path = dir
            .path()
            .join(format!("array/0{}", backend.extension()));
        assert!(backend.open_read(&path)?.is_none());

        let mut container = backend.open(&path)?;
        for member in ["0/0", "0/1", "1/0", "1/1"] {
            container.write(member, member.as_bytes())?;
        }
        container.close()?;

        let container = backend.open_read(&path)?.unwrap();
        let listing = container.list("");
        assert!(listing.members.is_empty());
        assert_eq!(listing.prefixes, ["0/", "1/"]);
        assert_eq!(container.list("1/").members, ["1/0", "1/1"]);
        assert!(container.contains("1/1"));
        assert!(!container.contains("1"));
        assert!(backend.is_container_path(&path));
    }
    Ok(())
}
