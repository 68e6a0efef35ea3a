use crate::error::{DhtError, Result};
use crate::key::Key;
use crate::transport::Rank;

/// djb2: start at 5381, then `h = h * 33 + byte` for every byte.
pub fn djb2(bytes: &[u8]) -> u64 {
    bytes.iter().fold(5381u64, |hash, &byte| {
        hash.wrapping_mul(33).wrapping_add(u64::from(byte))
    })
}

/// Maps keys to the rank that owns them in a fixed-size cluster.
#[derive(Debug, Clone, Copy)]
pub struct HashRouter {
    nodes: usize,
}

impl HashRouter {
    pub fn new(nodes: usize) -> Result<Self> {
        if nodes == 0 {
            return Err(DhtError::Config("a cluster needs at least one node".into()));
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    pub fn route(&self, key: &Key) -> Rank {
        (djb2(key.as_bytes()) % self.nodes as u64) as Rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn djb2_known_values() {
        assert_eq!(djb2(b""), 5381);
        assert_eq!(djb2(b"a"), 5381 * 33 + 97);
        assert_eq!(djb2(b"ab"), (5381 * 33 + 97) * 33 + 98);
    }

    #[test]
    fn routing_is_deterministic_and_in_range() {
        let router = HashRouter::new(5).unwrap();
        for i in 0..500 {
            let key = Key::new(format!("key-{i}")).unwrap();
            let owner = router.route(&key);
            assert!(owner < 5);
            assert_eq!(owner, router.route(&key));
        }
    }

    #[test]
    fn spreads_keys_over_every_node() {
        let router = HashRouter::new(4).unwrap();
        let mut hits = [0usize; 4];
        for i in 0..1_000 {
            hits[router.route(&Key::new(format!("user{i}")).unwrap())] += 1;
        }
        assert!(hits.iter().all(|&h| h > 0), "distribution: {hits:?}");
    }

    #[test]
    fn single_node_owns_everything() {
        let router = HashRouter::new(1).unwrap();
        assert_eq!(router.route(&Key::new("anything").unwrap()), 0);
    }

    #[test]
    fn rejects_empty_cluster() {
        assert!(HashRouter::new(0).is_err());
    }
}
