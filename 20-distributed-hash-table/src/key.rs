//! Keys stored in the table.

use std::fmt;

use crate::error::{DhtError, Result};

/// Longest key the table accepts, in bytes. The wire format reserves one more
/// byte for the NUL terminator.
pub const MAX_KEY_LEN: usize = 63;

/// A validated table key: at most [`MAX_KEY_LEN`] bytes and no NUL bytes.
///
/// Ordering is byte-wise lexicographic, which is the order the local store
/// keeps and drains its pairs in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Validates `key`, rejecting it when it is too long or contains NUL.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.len() > MAX_KEY_LEN {
            return Err(DhtError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if key.as_bytes().contains(&0) {
            return Err(DhtError::KeyContainsNul);
        }
        Ok(Self(key))
    }

    /// Builds a key by cutting `key` down to fit instead of rejecting it.
    ///
    /// Everything from the first NUL byte on is dropped, then the remainder
    /// is cut at the last UTF-8 character boundary at or below
    /// [`MAX_KEY_LEN`] bytes. Two long keys sharing their first 63 bytes
    /// collapse into the same key, so drivers should only opt into this when
    /// that is acceptable.
    pub fn truncated(key: &str) -> Self {
        let key = key.split('\0').next().unwrap_or_default();
        let mut end = key.len().min(MAX_KEY_LEN);
        while !key.is_char_boundary(end) {
            end -= 1;
        }
        Self(key[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
