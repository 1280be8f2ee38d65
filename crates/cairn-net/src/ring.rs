//! Consistent-hashing ring over a 10-bit identifier space.
//!
//! Membership is explicit: nodes are added with [`HashRing::join`] and removed
//! with [`HashRing::leave`]. Every change rebuilds successor, predecessor and
//! finger pointers for the whole ring under one write lock, so readers never
//! observe a half-updated topology.
//!
//! Each member also owns a small key/value map holding the entries it was
//! responsible for at write time. Entries are not migrated when membership
//! changes and are lost when their owner leaves.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use cairn_shared::constants::RING_BITS;
use cairn_shared::{NodeIdentity, RingPosition};

use crate::error::RingError;

/// A value held by the node responsible for `key`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Member {
    identity: NodeIdentity,
    successor: RingPosition,
    predecessor: RingPosition,
    fingers: Vec<RingPosition>,
    entries: HashMap<String, StoredEntry>,
}

impl Member {
    fn new(identity: NodeIdentity) -> Self {
        let position = identity.ring_position();
        Self {
            identity,
            successor: position,
            predecessor: position,
            fingers: Vec::new(),
            entries: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Topology {
    members: BTreeMap<RingPosition, Member>,
}

impl Topology {
    /// First member at or after `target`, wrapping to the lowest position.
    fn owner_position(&self, target: RingPosition) -> Option<RingPosition> {
        self.members
            .range(target..)
            .next()
            .or_else(|| self.members.iter().next())
            .map(|(pos, _)| *pos)
    }

    fn owner(&self, target: RingPosition) -> Result<&Member, RingError> {
        self.owner_position(target)
            .and_then(|pos| self.members.get(&pos))
            .ok_or(RingError::EmptyRing)
    }

    fn member(&self, node: &NodeIdentity) -> Result<&Member, RingError> {
        self.members
            .get(&node.ring_position())
            .filter(|m| m.identity == *node)
            .ok_or_else(|| RingError::UnknownNode(node.clone()))
    }

    /// Recompute every member's links from the current sorted membership.
    fn rebuild(&mut self) {
        let positions: Vec<RingPosition> = self.members.keys().copied().collect();
        let n = positions.len();
        if n == 0 {
            return;
        }

        let mut fingers_by_pos = Vec::with_capacity(n);
        for &pos in &positions {
            let fingers: Vec<RingPosition> = (0..RING_BITS)
                .filter_map(|i| self.owner_position(pos.offset(1 << i)))
                .collect();
            fingers_by_pos.push(fingers);
        }

        for (i, fingers) in fingers_by_pos.into_iter().enumerate() {
            if let Some(member) = self.members.get_mut(&positions[i]) {
                member.successor = positions[(i + 1) % n];
                member.predecessor = positions[(i + n - 1) % n];
                member.fingers = fingers;
            }
        }
    }
}

/// `x` lies in the circular half-open interval `(from, to]`.
///
/// `from == to` denotes the whole ring.
fn in_interval(x: RingPosition, from: RingPosition, to: RingPosition) -> bool {
    let (x, from, to) = (x.value(), from.value(), to.value());
    match from.cmp(&to) {
        std::cmp::Ordering::Less => from < x && x <= to,
        std::cmp::Ordering::Greater => x > from || x <= to,
        std::cmp::Ordering::Equal => true,
    }
}

/// `x` lies strictly between `from` and `to` going clockwise.
fn strictly_between(x: RingPosition, from: RingPosition, to: RingPosition) -> bool {
    x != to && in_interval(x, from, to)
}

/// Shared ring state. Cheap to read concurrently; membership changes are
/// serialized by the internal write lock.
#[derive(Debug, Default)]
pub struct HashRing {
    topology: RwLock<Topology>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and rebuild the ring.
    ///
    /// Rejects a node whose position is already taken, including a second
    /// join of the same identity.
    pub fn join(&self, node: NodeIdentity) -> Result<RingPosition, RingError> {
        let position = node.ring_position();
        let mut topology = self.topology.write();

        if let Some(existing) = topology.members.get(&position) {
            warn!(node = %node, existing = %existing.identity, position = %position, "Ring position collision");
            return Err(RingError::PositionCollision {
                position,
                existing: existing.identity.clone(),
            });
        }

        topology.members.insert(position, Member::new(node.clone()));
        topology.rebuild();

        info!(node = %node, position = %position, members = topology.members.len(), "Node joined ring");
        Ok(position)
    }

    /// Remove a node and rebuild the ring. Its stored entries are dropped.
    pub fn leave(&self, node: &NodeIdentity) -> Result<(), RingError> {
        let mut topology = self.topology.write();
        topology.member(node)?;

        let position = node.ring_position();
        if let Some(member) = topology.members.remove(&position) {
            if !member.entries.is_empty() {
                warn!(node = %node, dropped = member.entries.len(), "Leaving node takes its entries with it");
            }
        }
        topology.rebuild();

        info!(node = %node, position = %position, members = topology.members.len(), "Node left ring");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.topology.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members ordered by ring position.
    pub fn members(&self) -> Vec<NodeIdentity> {
        self.topology
            .read()
            .members
            .values()
            .map(|m| m.identity.clone())
            .collect()
    }

    /// The node owning `position`: the first member at or after it, with
    /// wraparound.
    pub fn owner_of(&self, position: RingPosition) -> Result<NodeIdentity, RingError> {
        Ok(self.topology.read().owner(position)?.identity.clone())
    }

    /// Authoritative lookup by linear scan of the sorted membership.
    pub fn responsible_node(&self, key: &str) -> Result<NodeIdentity, RingError> {
        self.owner_of(RingPosition::of_key(key))
    }

    /// `node` owns `key`, i.e. the key falls in `(predecessor, node]`.
    pub fn is_responsible(&self, node: &NodeIdentity, key: &str) -> Result<bool, RingError> {
        let topology = self.topology.read();
        let member = topology.member(node)?;
        Ok(in_interval(
            RingPosition::of_key(key),
            member.predecessor,
            node.ring_position(),
        ))
    }

    pub fn successor(&self, node: &NodeIdentity) -> Result<NodeIdentity, RingError> {
        self.link(node, |m| m.successor)
    }

    pub fn predecessor(&self, node: &NodeIdentity) -> Result<NodeIdentity, RingError> {
        self.link(node, |m| m.predecessor)
    }

    /// Finger `i` is the owner of `position + 2^i`.
    pub fn fingers(&self, node: &NodeIdentity) -> Result<Vec<NodeIdentity>, RingError> {
        let topology = self.topology.read();
        let member = topology.member(node)?;
        Ok(member
            .fingers
            .iter()
            .filter_map(|pos| topology.members.get(pos))
            .map(|m| m.identity.clone())
            .collect())
    }

    fn link(
        &self,
        node: &NodeIdentity,
        pick: impl Fn(&Member) -> RingPosition,
    ) -> Result<NodeIdentity, RingError> {
        let topology = self.topology.read();
        let member = topology.member(node)?;
        topology
            .members
            .get(&pick(member))
            .map(|m| m.identity.clone())
            .ok_or(RingError::EmptyRing)
    }

    /// Route a lookup for `key` starting at `from`, following fingers.
    ///
    /// Returns the owner and the number of hops taken. The result is checked
    /// against the owner's responsibility interval and falls back to a linear
    /// scan if routing did not converge.
    pub fn route(&self, from: &NodeIdentity, key: &str) -> Result<(NodeIdentity, usize), RingError> {
        let topology = self.topology.read();
        let target = RingPosition::of_key(key);
        let mut current = topology.member(from)?;

        for hops in 0..=topology.members.len() {
            let here = current.identity.ring_position();
            if in_interval(target, current.predecessor, here) {
                return Ok((current.identity.clone(), hops));
            }
            if in_interval(target, here, current.successor) {
                if let Some(next) = topology.members.get(&current.successor) {
                    return Ok((next.identity.clone(), hops + 1));
                }
            }

            // Closest preceding finger, falling back to the successor.
            let next = current
                .fingers
                .iter()
                .rev()
                .find(|f| strictly_between(**f, here, target))
                .copied()
                .unwrap_or(current.successor);
            match topology.members.get(&next) {
                Some(member) => current = member,
                None => break,
            }
        }

        debug!(from = %from, key = %key, "Finger routing did not converge, scanning");
        let owner = topology.owner(target)?;
        Ok((owner.identity.clone(), topology.members.len()))
    }

    /// Store `value` on the node currently responsible for `key`.
    pub fn store(&self, key: &str, value: serde_json::Value) -> Result<NodeIdentity, RingError> {
        let mut topology = self.topology.write();
        let owner = topology
            .owner_position(RingPosition::of_key(key))
            .ok_or(RingError::EmptyRing)?;
        let member = topology.members.get_mut(&owner).ok_or(RingError::EmptyRing)?;

        member.entries.insert(
            key.to_string(),
            StoredEntry {
                key: key.to_string(),
                value,
                timestamp: Utc::now(),
            },
        );
        debug!(key = %key, owner = %member.identity, "Stored entry");
        Ok(member.identity.clone())
    }

    /// Look `key` up on its current owner.
    pub fn retrieve(&self, key: &str) -> Result<Option<StoredEntry>, RingError> {
        let topology = self.topology.read();
        let owner = topology.owner(RingPosition::of_key(key))?;
        Ok(owner.entries.get(key).cloned())
    }

    /// Store a chat payload under `msg_<unix-nanos>_<sender_id>`. Returns the
    /// generated key.
    pub fn store_message(
        &self,
        sender_id: &str,
        value: serde_json::Value,
    ) -> Result<String, RingError> {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let key = format!("msg_{nanos}_{sender_id}");
        self.store(&key, value)?;
        Ok(key)
    }

    /// Entries currently held by `node`.
    pub fn entries(&self, node: &NodeIdentity) -> Result<Vec<StoredEntry>, RingError> {
        let topology = self.topology.read();
        let mut entries: Vec<StoredEntry> = topology.member(node)?.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_shared::constants::RING_SIZE;
    use cairn_shared::UserId;

    fn node(port: u16) -> NodeIdentity {
        NodeIdentity::new("127.0.0.1", port, UserId::new(format!("u{port}")))
    }

    /// `count` nodes with pairwise distinct positions.
    fn distinct_nodes(count: usize) -> Vec<NodeIdentity> {
        let mut seen = std::collections::HashSet::new();
        (5000u16..)
            .map(node)
            .filter(|n| seen.insert(n.ring_position()))
            .take(count)
            .collect()
    }

    fn ring_of(count: usize) -> (HashRing, Vec<NodeIdentity>) {
        let ring = HashRing::new();
        let nodes = distinct_nodes(count);
        for n in &nodes {
            ring.join(n.clone()).unwrap();
        }
        (ring, nodes)
    }

    /// A key hashing to each of the 1024 positions.
    fn keys_for_every_position() -> Vec<String> {
        let mut keys: Vec<Option<String>> = vec![None; RING_SIZE as usize];
        let mut remaining = RING_SIZE as usize;
        let mut i = 0u64;
        while remaining > 0 {
            let key = format!("key-{i}");
            let slot = &mut keys[RingPosition::of_key(&key).value() as usize];
            if slot.is_none() {
                *slot = Some(key);
                remaining -= 1;
            }
            i += 1;
        }
        keys.into_iter().flatten().collect()
    }

    #[test]
    fn test_interval() {
        let p = RingPosition;
        assert!(in_interval(p(5), p(3), p(5)));
        assert!(!in_interval(p(3), p(3), p(5)));
        assert!(in_interval(p(1020), p(1000), p(10)));
        assert!(in_interval(p(10), p(1000), p(10)));
        assert!(!in_interval(p(500), p(1000), p(10)));
        assert!(in_interval(p(123), p(7), p(7)));
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new();
        assert!(matches!(ring.responsible_node("x"), Err(RingError::EmptyRing)));
        assert!(matches!(ring.store("x", serde_json::json!(1)), Err(RingError::EmptyRing)));
    }

    #[test]
    fn test_single_node_owns_everything() {
        let (ring, nodes) = ring_of(1);
        let only = &nodes[0];

        assert_eq!(ring.successor(only).unwrap(), *only);
        assert_eq!(ring.predecessor(only).unwrap(), *only);
        for key in ["a", "b", "report.pdf"] {
            assert_eq!(ring.responsible_node(key).unwrap(), *only);
            assert!(ring.is_responsible(only, key).unwrap());
            assert_eq!(ring.route(only, key).unwrap().0, *only);
        }
    }

    #[test]
    fn test_successor_links_form_single_cycle() {
        for size in [2, 3, 8, 20] {
            let (ring, nodes) = ring_of(size);
            for start in &nodes {
                let mut visited = std::collections::HashSet::new();
                let mut current = start.clone();
                loop {
                    assert!(visited.insert(current.clone()), "node visited twice");
                    current = ring.successor(&current).unwrap();
                    if current == *start {
                        break;
                    }
                }
                assert_eq!(visited.len(), size);
            }

            for n in &nodes {
                let succ = ring.successor(n).unwrap();
                assert_eq!(ring.predecessor(&succ).unwrap(), *n);
            }
        }
    }

    #[test]
    fn test_exactly_one_responsible_node_per_key() {
        let (ring, nodes) = ring_of(7);
        for key in keys_for_every_position() {
            let owners: Vec<&NodeIdentity> = nodes
                .iter()
                .filter(|n| ring.is_responsible(n, &key).unwrap())
                .collect();
            assert_eq!(owners.len(), 1, "key {key}");
            assert_eq!(*owners[0], ring.responsible_node(&key).unwrap());
        }
    }

    #[test]
    fn test_node_is_responsible_for_its_own_position() {
        let (ring, nodes) = ring_of(5);
        for n in &nodes {
            assert_eq!(ring.owner_of(n.ring_position()).unwrap(), *n);
            let after = n.ring_position().offset(1);
            assert_eq!(ring.owner_of(after).unwrap(), ring.successor(n).unwrap());
        }
    }

    #[test]
    fn test_fingers_point_at_offset_owners() {
        let (ring, nodes) = ring_of(10);
        for n in &nodes {
            let fingers = ring.fingers(n).unwrap();
            assert_eq!(fingers.len(), RING_BITS as usize);
            for (i, finger) in fingers.iter().enumerate() {
                let expected = ring.owner_of(n.ring_position().offset(1 << i)).unwrap();
                assert_eq!(*finger, expected);
            }
        }
    }

    #[test]
    fn test_route_agrees_with_linear_scan() {
        let (ring, nodes) = ring_of(12);
        let keys = keys_for_every_position();
        for from in &nodes {
            for key in keys.iter().step_by(7) {
                let (routed, hops) = ring.route(from, key).unwrap();
                assert_eq!(routed, ring.responsible_node(key).unwrap());
                assert!(hops <= nodes.len());
            }
        }
    }

    #[test]
    fn test_collision_rejected() {
        let ring = HashRing::new();
        let first = node(5000);
        ring.join(first.clone()).unwrap();

        let clash = (5001u16..)
            .map(node)
            .find(|n| n.ring_position() == first.ring_position())
            .unwrap();
        match ring.join(clash) {
            Err(RingError::PositionCollision { position, existing }) => {
                assert_eq!(position, first.ring_position());
                assert_eq!(existing, first);
            }
            other => panic!("expected collision, got {other:?}"),
        }

        assert!(matches!(
            ring.join(first.clone()),
            Err(RingError::PositionCollision { .. })
        ));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_leave_rebuilds_links() {
        let (ring, nodes) = ring_of(4);
        let gone = &nodes[1];
        let before = ring.predecessor(gone).unwrap();
        let after = ring.successor(gone).unwrap();

        ring.leave(gone).unwrap();
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.successor(&before).unwrap(), after);
        assert_eq!(ring.predecessor(&after).unwrap(), before);
        assert!(matches!(ring.leave(gone), Err(RingError::UnknownNode(_))));
        assert!(matches!(ring.successor(gone), Err(RingError::UnknownNode(_))));
    }

    #[test]
    fn test_store_and_retrieve() {
        let (ring, _) = ring_of(5);
        let owner = ring.store("report.pdf", serde_json::json!({"size": 10})).unwrap();
        assert_eq!(owner, ring.responsible_node("report.pdf").unwrap());

        let entry = ring.retrieve("report.pdf").unwrap().unwrap();
        assert_eq!(entry.key, "report.pdf");
        assert_eq!(entry.value["size"], 10);
        assert!(ring.retrieve("missing").unwrap().is_none());
        assert_eq!(ring.entries(&owner).unwrap().len(), 1);
    }

    #[test]
    fn test_store_message_key_shape() {
        let (ring, _) = ring_of(3);
        let key = ring.store_message("42", serde_json::json!("hello")).unwrap();
        assert!(key.starts_with("msg_"));
        assert!(key.ends_with("_42"));
        assert_eq!(ring.retrieve(&key).unwrap().unwrap().value, "hello");
    }

    #[test]
    fn test_entries_lost_with_owner() {
        let (ring, _) = ring_of(3);
        let owner = ring.store("k", serde_json::json!(true)).unwrap();
        ring.leave(&owner).unwrap();
        assert!(ring.retrieve("k").unwrap().is_none());
    }
}
