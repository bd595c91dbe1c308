use derive_more::{Display, From};
use thiserror::Error;

use crate::StorePrefix;

/// A store key.
///
/// A key is a `/` separated path with at least one non-empty segment.
/// It does not start or end with `/`, and no segment is `.` or `..`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Display)]
#[display("{_0}")]
pub struct StoreKey(String);

/// A list of [`StoreKey`].
pub type StoreKeys = Vec<StoreKey>;

/// An invalid store key.
#[derive(Debug, Clone, Error, From)]
#[error("invalid store key {0}")]
pub struct StoreKeyError(String);

impl StoreKey {
    /// Create a new store key from `key`.
    ///
    /// # Errors
    /// Returns [`StoreKeyError`] if `key` is not valid according to [`StoreKey::validate`].
    pub fn new(key: impl Into<String>) -> Result<Self, StoreKeyError> {
        let key: String = key.into();
        if Self::validate(&key) {
            Ok(Self(key))
        } else {
            Err(StoreKeyError(key))
        }
    }

    /// Create a new store key from `key` without validation.
    ///
    /// # Safety
    /// `key` is not validated, so this can result in an invalid store key.
    #[must_use]
    pub unsafe fn new_unchecked(key: impl Into<String>) -> Self {
        let key: String = key.into();
        debug_assert!(Self::validate(&key));
        Self(key)
    }

    /// Extracts a string slice of the underlying `String`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Validates a key.
    #[must_use]
    pub fn validate(key: &str) -> bool {
        !key.is_empty()
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
    }

    /// Returns true if the key has prefix `prefix`.
    #[must_use]
    pub fn has_prefix(&self, prefix: &StorePrefix) -> bool {
        self.0.starts_with(prefix.as_str())
    }

    /// Returns the path segments of the key.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Returns the final segment of the key.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Returns the parent prefix of the key.
    #[must_use]
    pub fn parent(&self) -> StorePrefix {
        let parent = self.0.rsplit_once('/').map_or("", |(parent, _)| parent);
        if parent.is_empty() {
            StorePrefix::root()
        } else {
            // SAFETY: the parent of a valid key is a valid prefix once terminated by /
            unsafe { StorePrefix::new_unchecked(parent.to_string() + "/") }
        }
    }
}

impl TryFrom<&str> for StoreKey {
    type Error = StoreKeyError;

    fn try_from(key: &str) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}

impl TryFrom<String> for StoreKey {
    type Error = StoreKeyError;

    fn try_from(key: String) -> Result<Self, Self::Error> {
        Self::new(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key_validation() {
        assert!(StoreKey::new("a").is_ok());
        assert!(StoreKey::new("a/b/.zarray").is_ok());
        assert!(StoreKey::new("").is_err());
        assert!(StoreKey::new("/a").is_err());
        assert!(StoreKey::new("a/").is_err());
        assert!(StoreKey::new("a//b").is_err());
        assert!(StoreKey::new("a/../b").is_err());
    }

    #[test]
    fn store_key_parent() {
        let key = StoreKey::new("a/b/c").unwrap();
        assert_eq!(key.parent().as_str(), "a/b/");
        assert_eq!(key.file_name(), "c");
        assert_eq!(key.segments().collect::<Vec<_>>(), ["a", "b", "c"]);
        assert_eq!(StoreKey::new("c").unwrap().parent(), StorePrefix::root());
        assert!(key.has_prefix(&StorePrefix::new("a/").unwrap()));
        assert!(!key.has_prefix(&StorePrefix::new("b/").unwrap()));
    }
}
