//! Consistent-hash ring mapping topic names to cluster nodes.
//!
//! Each node contributes ~20 replicas; lookups binary-search the sorted
//! point array. The ring also carries a signature over the sorted node
//! list: every cross-node message is stamped with it so a peer holding a
//! stale ring is rejected instead of silently misrouting.

use sha2::{Digest, Sha256};

/// Replicas each node contributes to the ring.
pub const HASH_REPLICAS: usize = 20;

fn hash_point(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().expect("sha256 yields 32 bytes"))
}

#[derive(Debug, Clone)]
struct Point {
    hash: u64,
    node: String,
}

/// Immutable ring; rehashing replaces the whole value.
#[derive(Debug, Clone)]
pub struct Ring {
    points: Vec<Point>,
    signature: String,
}

impl Ring {
    /// Build a ring over the given node names. Order of the input does not
    /// matter; the signature is computed over the sorted list.
    pub fn new(replicas: usize, nodes: &[String]) -> Self {
        let mut points = Vec::with_capacity(nodes.len() * replicas);
        for node in nodes {
            for idx in 0..replicas {
                points.push(Point {
                    hash: hash_point(&format!("{node}:{idx}")),
                    node: node.clone(),
                });
            }
        }
        points.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.node.cmp(&b.node)));

        let mut sorted = nodes.to_vec();
        sorted.sort();
        let mut hasher = Sha256::new();
        for name in &sorted {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        let signature = format!("{:x}", hasher.finalize());

        Self { points, signature }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Node owning `key`. Empty string when the ring has no nodes.
    pub fn get(&self, key: &str) -> &str {
        if self.points.is_empty() {
            return "";
        }
        let h = hash_point(key);
        let idx = match self.points.binary_search_by(|p| p.hash.cmp(&h)) {
            Ok(i) => i,
            Err(i) if i == self.points.len() => 0, // wrap around
            Err(i) => i,
        };
        &self.points[idx].node
    }

    /// Signature over the sorted node list; stamped into every cross-node
    /// message.
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lookup_is_deterministic() {
        let ring = Ring::new(HASH_REPLICAS, &nodes(&["one", "two", "three"]));
        for key in ["grpAbc", "usrXYZ", "p2pSomething", ""] {
            assert_eq!(ring.get(key), ring.get(key));
        }
    }

    #[test]
    fn signature_ignores_node_order() {
        let a = Ring::new(HASH_REPLICAS, &nodes(&["one", "two", "three"]));
        let b = Ring::new(HASH_REPLICAS, &nodes(&["three", "one", "two"]));
        assert_eq!(a.signature(), b.signature());

        let c = Ring::new(HASH_REPLICAS, &nodes(&["one", "two"]));
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn all_nodes_receive_keys() {
        let names = nodes(&["one", "two", "three"]);
        let ring = Ring::new(HASH_REPLICAS, &names);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            seen.insert(ring.get(&format!("grpTopic{i}")).to_string());
        }
        assert_eq!(seen.len(), names.len());
    }

    #[test]
    fn adding_a_node_only_moves_keys_to_it() {
        let before = Ring::new(HASH_REPLICAS, &nodes(&["one", "two", "three"]));
        let after = Ring::new(HASH_REPLICAS, &nodes(&["one", "two", "three", "four"]));

        let mut moved = 0;
        let total = 1000;
        for i in 0..total {
            let key = format!("grpTopic{i}");
            let old = before.get(&key);
            let new = after.get(&key);
            if old != new {
                // Ownership may only move to the new node, never shuffle
                // between surviving nodes.
                assert_eq!(new, "four", "key {key} moved {old} -> {new}");
                moved += 1;
            }
        }
        // The new node should own a meaningful share, roughly 1/4.
        assert!(moved > 0 && moved < total / 2, "moved {moved}");
    }

    #[test]
    fn empty_ring_returns_empty() {
        let ring = Ring::new(HASH_REPLICAS, &[]);
        assert!(ring.is_empty());
        assert_eq!(ring.get("anything"), "");
    }
}
