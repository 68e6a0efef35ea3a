//! Node-local ordered key-value storage.
//!
//! Each node keeps the pairs it owns in a [`LocalStore`]. The store knows
//! nothing about other nodes; the server loop is its only writer.

use std::io::{self, Write};

use crate::key::Key;

/// Default number of pairs a single node can hold.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// One stored association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: Key,
    pub value: i64,
}

/// What a [`LocalStore::put`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was new and has been inserted.
    Inserted,
    /// The key existed and its value was overwritten in place.
    Updated,
    /// The key was new but the store is at capacity; nothing was written
    /// and the key is handed back.
    Rejected(Key),
}

/// Sorted, bounded table of key-value pairs.
///
/// Pairs live in one contiguous vector ordered by key, so lookups are a
/// binary search and inserts shift the tail by one slot. That is O(n) per
/// insert, which is fine at tens of thousands of keys per node. Swapping the
/// vector for a `BTreeMap` would make inserts O(log n) without changing
/// [`drain`](Self::drain) output.
#[derive(Debug)]
pub struct LocalStore {
    pairs: Vec<KeyValuePair>,
    capacity: usize,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalStore {
    /// Creates an empty store that holds at most `capacity` pairs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pairs: Vec::new(),
            capacity,
        }
    }

    /// Stores `value` under `key`, overwriting any existing value.
    ///
    /// A new key arriving while the store is full is dropped and
    /// [`PutOutcome::Rejected`] is returned; the caller decides how loudly to
    /// report it.
    pub fn put(&mut self, key: Key, value: i64) -> PutOutcome {
        match self.find(key.as_str()) {
            Ok(idx) => {
                self.pairs[idx].value = value;
                PutOutcome::Updated
            }
            Err(_) if self.pairs.len() >= self.capacity => PutOutcome::Rejected(key),
            Err(idx) => {
                self.pairs.insert(idx, KeyValuePair { key, value });
                PutOutcome::Inserted
            }
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<i64> {
        self.find(key).ok().map(|idx| self.pairs[idx].value)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Writes every pair to `sink` in ascending key order, one line each,
    /// then empties the store. Returns the number of pairs written.
    ///
    /// The store is only emptied once every line has been written and
    /// flushed; on a write error it is left as it was.
    pub fn drain<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        for pair in &self.pairs {
            writeln!(sink, "  Key=\"{}\" Value={}", pair.key, pair.value)?;
        }
        sink.flush()?;
        let written = self.pairs.len();
        self.pairs.clear();
        Ok(written)
    }

    // Ok(idx) if present, Err(idx) with the insertion point otherwise.
    fn find(&self, key: &str) -> Result<usize, usize> {
        self.pairs
            .binary_search_by(|pair| pair.key.as_str().as_bytes().cmp(key.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> Key {
        Key::new(k).unwrap()
    }

    #[test]
    fn put_then_get() {
        let mut store = LocalStore::default();
        assert_eq!(store.put(key("alice"), 42), PutOutcome::Inserted);
        assert_eq!(store.get("alice"), Some(42));
        assert_eq!(store.get("bob"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn overwrite_keeps_size() {
        let mut store = LocalStore::default();
        store.put(key("k"), 1);
        assert_eq!(store.put(key("k"), 2), PutOutcome::Updated);
        assert_eq!(store.get("k"), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn keeps_pairs_sorted() {
        let mut store = LocalStore::default();
        for (k, v) in [("m", 1), ("c", 2), ("x", 3), ("a", 4), ("mm", 5)] {
            store.put(key(k), v);
        }
        let keys: Vec<&str> = store.pairs.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c", "m", "mm", "x"]);
        for (k, v) in [("m", 1), ("c", 2), ("x", 3), ("a", 4), ("mm", 5)] {
            assert_eq!(store.get(k), Some(v), "lookup of {k}");
        }
    }

    #[test]
    fn rejects_new_keys_at_capacity() {
        let mut store = LocalStore::with_capacity(2);
        store.put(key("a"), 1);
        store.put(key("b"), 2);
        assert_eq!(store.put(key("c"), 3), PutOutcome::Rejected(key("c")));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("c"), None);

        // Existing keys can still be overwritten when full.
        assert_eq!(store.put(key("a"), 10), PutOutcome::Updated);
        assert_eq!(store.get("a"), Some(10));
    }

    #[test]
    fn drain_writes_sorted_lines_and_empties() {
        let mut store = LocalStore::default();
        store.put(key("bob"), 7);
        store.put(key("alice"), 42);
        store.put(key("carol"), -3);

        let mut out = Vec::new();
        assert_eq!(store.drain(&mut out).unwrap(), 3);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "  Key=\"alice\" Value=42\n  Key=\"bob\" Value=7\n  Key=\"carol\" Value=-3\n"
        );
        assert!(store.is_empty());
    }

    #[test]
    fn failed_drain_keeps_pairs() {
        struct BrokenSink;

        impl Write for BrokenSink {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut store = LocalStore::with_capacity(4);
        store.put(key("a"), 1);
        store.put(key("b"), 2);
        assert!(store.drain(&mut BrokenSink).is_err());
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("b"), Some(2));
    }
}
