//! Consistent hash ring with virtual nodes.
//!
//! Each physical node occupies `virtual_nodes` positions on a 32-bit ring,
//! at `murmur3("<node_id>#<i>")` for `i` in `0..virtual_nodes`. A key is
//! owned by the first virtual node clockwise from its own hash.

use crate::murmur3::murmur3_x86_32;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

/// Hash seed shared by every node in the cluster.
const RING_SEED: u32 = 0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RingError {
    #[error("empty ring: no nodes available")]
    EmptyRing,
}

#[derive(Debug, Default)]
struct RingState {
    /// Physical node ids.
    physical: BTreeSet<String>,
    /// Virtual-node position on the ring -> physical node id.
    ring: BTreeMap<u32, String>,
}

/// Deterministic partition function mapping keys to replica nodes.
///
/// One mutex serializes all operations; lookups are logarithmic in the
/// number of virtual entries.
#[derive(Debug)]
pub struct HashRing {
    state: Mutex<RingState>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            state: Mutex::new(RingState::default()),
            virtual_nodes,
        }
    }

    /// Register a physical node; idempotent.
    pub fn add_node(&self, node_id: &str) {
        let mut state = self.state.lock();
        if !state.physical.insert(node_id.to_string()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let hash = self.vnode_hash(node_id, i);
            state.ring.insert(hash, node_id.to_string());
        }
        tracing::info!(
            node_id,
            vnodes = self.virtual_nodes,
            ring_size = state.ring.len(),
            "ring: added node"
        );
    }

    /// Unregister a physical node; idempotent.
    pub fn remove_node(&self, node_id: &str) {
        let mut state = self.state.lock();
        if !state.physical.remove(node_id) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let hash = self.vnode_hash(node_id, i);
            state.ring.remove(&hash);
        }
        tracing::info!(node_id, ring_size = state.ring.len(), "ring: removed node");
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.state.lock().physical.contains(node_id)
    }

    /// The node owning `key`: first ring entry clockwise from the key's
    /// hash, wrapping to the smallest entry.
    pub fn primary_node(&self, key: &str) -> Result<String, RingError> {
        let state = self.state.lock();
        if state.ring.is_empty() {
            return Err(RingError::EmptyRing);
        }
        let hash = self.hash_key(key);
        let owner = state
            .ring
            .range((Excluded(hash), Unbounded))
            .chain(state.ring.iter())
            .next()
            .map(|(_, id)| id.clone());
        owner.ok_or(RingError::EmptyRing)
    }

    /// The first `count` distinct physical nodes clockwise from the key's
    /// position. Returns fewer when the cluster has fewer physical nodes.
    pub fn nodes(&self, key: &str, count: usize) -> Result<Vec<String>, RingError> {
        let state = self.state.lock();
        if state.ring.is_empty() {
            return Err(RingError::EmptyRing);
        }
        let want = count.min(state.physical.len());
        let hash = self.hash_key(key);

        let mut result = Vec::with_capacity(want);
        for (_, node_id) in state
            .ring
            .range((Excluded(hash), Unbounded))
            .chain(state.ring.range(..=hash))
        {
            if !result.contains(node_id) {
                result.push(node_id.clone());
                if result.len() == want {
                    break;
                }
            }
        }
        Ok(result)
    }

    pub fn hash_key(&self, key: &str) -> u32 {
        murmur3_x86_32(key.as_bytes(), RING_SEED)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().physical.len()
    }

    pub fn ring_size(&self) -> usize {
        self.state.lock().ring.len()
    }

    pub fn all_nodes(&self) -> Vec<String> {
        self.state.lock().physical.iter().cloned().collect()
    }

    fn vnode_hash(&self, node_id: &str, index: usize) -> u32 {
        murmur3_x86_32(format!("{node_id}#{index}").as_bytes(), RING_SEED)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> HashRing {
        HashRing::new(150)
    }

    #[test]
    fn test_empty_ring_fails() {
        let r = ring();
        assert_eq!(r.primary_node("key"), Err(RingError::EmptyRing));
        assert_eq!(r.nodes("key", 3), Err(RingError::EmptyRing));
    }

    #[test]
    fn test_single_node_owns_everything() {
        let r = ring();
        r.add_node("node1");
        assert_eq!(r.node_count(), 1);
        assert_eq!(r.ring_size(), 150);
        for i in 0..50 {
            assert_eq!(r.primary_node(&format!("key-{i}")).unwrap(), "node1");
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let r = ring();
        r.add_node("node1");
        r.add_node("node1");
        assert_eq!(r.node_count(), 1);
        assert_eq!(r.ring_size(), 150);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let r = ring();
        r.add_node("node1");
        r.add_node("node2");
        r.remove_node("node1");
        r.remove_node("node1");
        assert_eq!(r.node_count(), 1);
        assert_eq!(r.ring_size(), 150);
        assert_eq!(r.primary_node("any").unwrap(), "node2");
    }

    #[test]
    fn test_has_node() {
        let r = ring();
        r.add_node("node1");
        assert!(r.has_node("node1"));
        assert!(!r.has_node("node2"));
    }

    #[test]
    fn test_lookup_is_deterministic() {
        let a = ring();
        let b = ring();
        for id in ["node1", "node2", "node3"] {
            a.add_node(id);
            b.add_node(id);
        }
        for i in 0..200 {
            let key = format!("key-{i}");
            assert_eq!(a.primary_node(&key).unwrap(), b.primary_node(&key).unwrap());
            assert_eq!(a.nodes(&key, 3).unwrap(), b.nodes(&key, 3).unwrap());
        }
    }

    #[test]
    fn test_replicas_are_distinct() {
        let r = ring();
        for id in ["node1", "node2", "node3", "node4", "node5"] {
            r.add_node(id);
        }
        for i in 0..100 {
            let key = format!("key-{i}");
            for count in 1..=5 {
                let nodes = r.nodes(&key, count).unwrap();
                assert_eq!(nodes.len(), count);
                let unique: BTreeSet<_> = nodes.iter().collect();
                assert_eq!(unique.len(), count, "duplicates for {key}");
            }
        }
    }

    #[test]
    fn test_replica_count_degrades() {
        let r = ring();
        r.add_node("node1");
        assert_eq!(r.nodes("key", 3).unwrap(), vec!["node1"]);

        r.add_node("node2");
        assert_eq!(r.nodes("key", 3).unwrap().len(), 2);
    }

    #[test]
    fn test_primary_is_first_replica() {
        let r = ring();
        for id in ["node1", "node2", "node3"] {
            r.add_node(id);
        }
        for i in 0..100 {
            let key = format!("key-{i}");
            assert_eq!(
                r.primary_node(&key).unwrap(),
                r.nodes(&key, 3).unwrap()[0]
            );
        }
    }

    #[test]
    fn test_distribution_is_roughly_balanced() {
        let r = ring();
        for id in ["node1", "node2", "node3"] {
            r.add_node(id);
        }
        let mut counts = std::collections::HashMap::new();
        for i in 0..3000 {
            let owner = r.primary_node(&format!("key-{i}")).unwrap();
            *counts.entry(owner).or_insert(0usize) += 1;
        }
        for (node, count) in &counts {
            assert!(
                *count > 3000 / 10,
                "{node} owns only {count} of 3000 keys"
            );
        }
    }

    #[test]
    fn test_join_moves_bounded_fraction_of_keys() {
        let r = ring();
        for id in ["node1", "node2", "node3"] {
            r.add_node(id);
        }

        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| r.primary_node(k).unwrap())
            .collect();

        r.add_node("node4");

        let mut moved = 0usize;
        for (key, old_owner) in keys.iter().zip(&before) {
            let new_owner = r.primary_node(key).unwrap();
            if new_owner != *old_owner {
                // Keys only ever move TO the new node.
                assert_eq!(new_owner, "node4");
                moved += 1;
            }
        }

        // Expect roughly 1/4 of keys to move; accept loose bounds.
        let fraction = moved as f64 / keys.len() as f64;
        assert!(
            (0.15..=0.50).contains(&fraction),
            "moved fraction {fraction} out of bounds"
        );
    }

    #[test]
    fn test_leave_only_moves_departed_keys() {
        let r = ring();
        for id in ["node1", "node2", "node3"] {
            r.add_node(id);
        }

        let keys: Vec<String> = (0..1000).map(|i| format!("key-{i}")).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| r.primary_node(k).unwrap())
            .collect();

        r.remove_node("node2");

        for (key, old_owner) in keys.iter().zip(&before) {
            let new_owner = r.primary_node(key).unwrap();
            if old_owner != "node2" {
                assert_eq!(new_owner, *old_owner, "unrelated key {key} moved");
            } else {
                assert_ne!(new_owner, "node2");
            }
        }
    }
}
