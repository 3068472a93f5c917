//! # Gridflow Ring
//!
//! Consistent-hash ring mapping workflow identifiers to their owning
//! cluster member. Each member contributes `replicas` virtual points at
//! `xxh3("{member}:{index}")` on a 64-bit ring; a key is owned by the
//! first virtual point at or clockwise-after `xxh3(key)`.
//!
//! The ring is a pure data structure: membership changes are pushed into
//! it by whoever owns the membership view. For a fixed member set,
//! `owner` is a deterministic function of the key on every node, because
//! xxh3 carries no per-process seed.

use std::collections::{BTreeMap, BTreeSet};

use xxhash_rust::xxh3::xxh3_64;

/// Default number of virtual points per member
pub const DEFAULT_REPLICAS: usize = 150;

/// Consistent-hash ring with virtual nodes
///
/// # Example
///
/// ```
/// use gridflow_ring::HashRing;
///
/// let mut ring = HashRing::new(150);
/// ring.add("node-a");
/// ring.add("node-b");
///
/// let owner = ring.owner("workflow-42").unwrap();
/// assert!(owner == "node-a" || owner == "node-b");
/// ```
#[derive(Debug, Clone)]
pub struct HashRing {
    replicas: usize,
    points: BTreeMap<u64, String>,
    members: BTreeSet<String>,
}

impl HashRing {
    /// Create an empty ring with the given virtual-point count per member
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Add a member; idempotent
    pub fn add(&mut self, member: impl Into<String>) {
        let member = member.into();
        if !self.members.insert(member.clone()) {
            return;
        }

        for index in 0..self.replicas {
            self.points
                .insert(point_position(&member, index), member.clone());
        }
    }

    /// Remove a member; idempotent
    pub fn remove(&mut self, member: &str) {
        if !self.members.remove(member) {
            return;
        }

        for index in 0..self.replicas {
            // Collisions between members are possible in principle; only
            // drop points that still belong to the removed member.
            let position = point_position(member, index);
            if self.points.get(&position).is_some_and(|m| m.as_str() == member) {
                self.points.remove(&position);
            }
        }
    }

    /// Owner of a key: clockwise successor on the ring
    ///
    /// `None` iff the ring is empty.
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let position = xxh3_64(key.as_bytes());
        self.points
            .range(position..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, member)| member.as_str())
    }

    /// Current member set
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.as_str())
    }

    /// Whether the member is on the ring
    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_REPLICAS)
    }
}

fn point_position(member: &str, index: usize) -> u64 {
    xxh3_64(format!("{member}:{index}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn three_node_ring() -> HashRing {
        let mut ring = HashRing::new(DEFAULT_REPLICAS);
        ring.add("node-1");
        ring.add("node-2");
        ring.add("node-3");
        ring
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = HashRing::new(150);
        assert!(ring.is_empty());
        assert_eq!(ring.owner("workflow-1"), None);
    }

    #[test]
    fn test_owner_is_deterministic() {
        let a = three_node_ring();
        let b = three_node_ring();

        for i in 0..100 {
            let key = format!("workflow-{i}");
            assert_eq!(a.owner(&key), b.owner(&key));
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut ring = three_node_ring();
        let before: Vec<_> = (0..50)
            .map(|i| ring.owner(&format!("workflow-{i}")).unwrap().to_string())
            .collect();

        ring.add("node-2");
        assert_eq!(ring.len(), 3);

        for (i, owner) in before.iter().enumerate() {
            assert_eq!(ring.owner(&format!("workflow-{i}")).unwrap(), owner);
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut ring = three_node_ring();
        ring.remove("node-2");
        ring.remove("node-2");
        assert_eq!(ring.len(), 2);
        assert!(!ring.contains("node-2"));

        for i in 0..50 {
            let owner = ring.owner(&format!("workflow-{i}")).unwrap();
            assert_ne!(owner, "node-2");
        }
    }

    #[test]
    fn test_distribution_is_roughly_balanced() {
        let ring = three_node_ring();
        let mut counts: HashMap<String, usize> = HashMap::new();

        for i in 0..3000 {
            let owner = ring.owner(&format!("workflow-{i}")).unwrap();
            *counts.entry(owner.to_string()).or_default() += 1;
        }

        // With 150 virtual points per member each node should land well
        // within 2x of the fair share.
        for (member, count) in &counts {
            assert!(
                *count > 500 && *count < 2000,
                "member {member} owns {count} of 3000 keys"
            );
        }
    }

    #[test]
    fn test_removal_disturbs_only_removed_members_keys() {
        let ring = three_node_ring();
        let before: HashMap<String, String> = (0..500)
            .map(|i| {
                let key = format!("workflow-{i}");
                let owner = ring.owner(&key).unwrap().to_string();
                (key, owner)
            })
            .collect();

        let mut smaller = ring.clone();
        smaller.remove("node-3");

        for (key, owner) in &before {
            let new_owner = smaller.owner(key).unwrap();
            if owner != "node-3" {
                assert_eq!(new_owner, owner, "key {key} moved needlessly");
            } else {
                assert_ne!(new_owner, "node-3");
            }
        }
    }

    #[test]
    fn test_wraparound_lookup() {
        let mut ring = HashRing::new(1);
        ring.add("solo");
        // With a single virtual point every key wraps to the same member
        assert_eq!(ring.owner("any-key"), Some("solo"));
        assert_eq!(ring.owner("another"), Some("solo"));
    }
}
