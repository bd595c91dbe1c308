//! Store key to physical location mapping.
//!
//! A store key with `n` segments is containerized at shard depth `d` when `d >= 2`, `n >= d`, and the key is not a metadata document.
//! Segment `n - d` names the container: the container file is the key truncated after that segment with the container extension appended,
//! and the member is the trailing `d - 1` segments joined by `/`.
//!
//! For example, at depth 3 with the `.shard` extension:
//!
//! | key | container | member |
//! |---|---|---|
//! | `array/0/1/2` | `array/0.shard` | `1/2` |
//! | `group/array/c/4/0/1` | `group/array/c/4.shard` | `0/1` |
//! | `array/zarr.json` | - | - |
//! | `array/1/2` | - | - |

use shardstore_storage::{StoreKey, StorePrefix};

/// Metadata document names that are never containerized.
const METADATA_DOCUMENTS: &[&str] = &["zarr.json"];

/// The container location of a store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerLocation {
    container: String,
    stem: usize,
    member: String,
}

impl ContainerLocation {
    /// The container path relative to the store root, including the container extension.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// The store prefix addressed by the container (the container path without its extension, `/` terminated).
    #[must_use]
    pub fn prefix(&self) -> StorePrefix {
        // SAFETY: the container stem is a non-empty sequence of valid key segments
        unsafe { StorePrefix::new_unchecked(format!("{}/", &self.container[..self.stem])) }
    }

    /// The member name within the container.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }
}

/// Maps store keys to loose files or container members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    depth: usize,
    extension: String,
}

impl KeyMapper {
    /// Create a new key mapper with shard depth `depth` and container extension `extension` (including the leading `.`).
    #[must_use]
    pub fn new(depth: usize, extension: impl Into<String>) -> Self {
        Self {
            depth,
            extension: extension.into(),
        }
    }

    /// The shard depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The container extension.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns true if `key` is a metadata document.
    ///
    /// Metadata documents are `zarr.json` and dot-prefixed documents such as `.zarray`, `.zgroup`, `.zattrs` and `.zmetadata`.
    #[must_use]
    pub fn is_metadata_key(key: &StoreKey) -> bool {
        let name = key.file_name();
        name.starts_with('.') || METADATA_DOCUMENTS.contains(&name)
    }

    /// Map `key` to its container location.
    ///
    /// Returns [`None`] if the key is stored as a loose file.
    #[must_use]
    pub fn map(&self, key: &StoreKey) -> Option<ContainerLocation> {
        if self.depth < 2 || Self::is_metadata_key(key) {
            return None;
        }
        let segments: Vec<&str> = key.segments().collect();
        let boundary = segments.len().checked_sub(self.depth)?;
        let stem = segments[..=boundary].join("/");
        Some(ContainerLocation {
            stem: stem.len(),
            container: stem + &self.extension,
            member: segments[boundary + 1..].join("/"),
        })
    }

    /// Returns true if `key` is stored in a container.
    #[must_use]
    pub fn is_container_key(&self, key: &StoreKey) -> bool {
        self.map(key).is_some()
    }

    /// Returns the container stem (the container path without its extension) if `path` is a container path relative to the store root.
    ///
    /// Returns [`None`] if `path` does not end with the container extension.
    #[must_use]
    pub fn container_key_for_path<'a>(&self, path: &'a str) -> Option<&'a str> {
        let stem = path.strip_suffix(&self.extension)?;
        let name = stem.rsplit('/').next().unwrap_or(stem);
        (!name.is_empty()).then_some(stem)
    }

    /// Reconstruct the store key of `member` in the container at `container` (relative to the store root).
    ///
    /// Returns [`None`] if `container` is not a container path or the joined key is not valid.
    #[must_use]
    pub fn reconstruct(&self, container: &str, member: &str) -> Option<StoreKey> {
        let stem = self.container_key_for_path(container)?;
        StoreKey::new(format!("{stem}/{member}")).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(key: &str) -> StoreKey {
        StoreKey::new(key).unwrap()
    }

    #[test]
    fn key_mapper_depth_three() {
        let mapper = KeyMapper::new(3, ".shard");
        let location = mapper.map(&key("array/0/1/2")).unwrap();
        assert_eq!(location.container(), "array/0.shard");
        assert_eq!(location.member(), "1/2");
        assert_eq!(location.prefix().as_str(), "array/0/");

        let location = mapper.map(&key("0/1/1")).unwrap();
        assert_eq!(location.container(), "0.shard");
        assert_eq!(location.member(), "1/1");
        assert_eq!(location.prefix().as_str(), "0/");

        let location = mapper.map(&key("group/array/c/4/0/1")).unwrap();
        assert_eq!(location.container(), "group/array/c/4.shard");
        assert_eq!(location.member(), "0/1");
    }

    #[test]
    fn key_mapper_loose_keys() {
        let mapper = KeyMapper::new(3, ".shard");
        assert!(!mapper.is_container_key(&key("array/1/2")));
        assert!(!mapper.is_container_key(&key("a/b/zarr.json")));
        assert!(!mapper.is_container_key(&key("a/b/.zarray")));
        assert!(!mapper.is_container_key(&key("a/b/c/.zattrs")));
        assert!(mapper.is_container_key(&key("a/b/c")));

        for depth in [0, 1] {
            assert!(!KeyMapper::new(depth, ".shard").is_container_key(&key("a/b/c/d")));
        }

        let mapper = KeyMapper::new(2, ".zip");
        let location = mapper.map(&key("a/b/c")).unwrap();
        assert_eq!(location.container(), "a/b.zip");
        assert_eq!(location.member(), "c");
    }

    #[test]
    fn key_mapper_metadata_keys() {
        for name in ["zarr.json", ".zarray", ".zgroup", ".zattrs", ".zmetadata"] {
            assert!(KeyMapper::is_metadata_key(&key(&format!("a/b/c/{name}"))));
        }
        assert!(!KeyMapper::is_metadata_key(&key("a/b/c/0")));
    }

    #[test]
    fn key_mapper_round_trip() {
        let keys = [
            "0/0/0",
            "array/0/1/2",
            "array/c/10/20/30/40",
            "a/b/c/d/e/f/g",
            "x/y.z/1",
        ];
        for depth in 2..=4 {
            let mapper = KeyMapper::new(depth, ".shard");
            for store_key in keys.map(key) {
                let Some(location) = mapper.map(&store_key) else {
                    assert!(store_key.segments().count() < depth);
                    continue;
                };
                assert_eq!(
                    mapper.reconstruct(location.container(), location.member()),
                    Some(store_key.clone())
                );
                assert_eq!(location.member().split('/').count(), depth - 1);
                assert!(store_key.has_prefix(&location.prefix()));
            }
        }
    }

    #[test]
    fn key_mapper_container_paths() {
        let mapper = KeyMapper::new(3, ".shard");
        assert_eq!(mapper.container_key_for_path("a/b/0.shard"), Some("a/b/0"));
        assert_eq!(mapper.container_key_for_path("0.shard"), Some("0"));
        assert_eq!(mapper.container_key_for_path("a/.shard"), None);
        assert_eq!(mapper.container_key_for_path("a/0.zip"), None);
        assert_eq!(mapper.reconstruct("a/0.zip", "1/2"), None);
    }

    #[test]
    fn key_mapper_scenario_two_containers() {
        // A (10, 10, 10) array with (5, 5, 5) chunks
        let mapper = KeyMapper::new(3, ".shard");
        let mut containers = std::collections::BTreeSet::new();
        for i in 0..2 {
            for j in 0..2 {
                for k in 0..2 {
                    let location = mapper.map(&key(&format!("{i}/{j}/{k}"))).unwrap();
                    containers.insert(location.container().to_string());
                }
            }
        }
        assert_eq!(
            containers.into_iter().collect::<Vec<_>>(),
            ["0.shard", "1.shard"]
        );
    }
}
