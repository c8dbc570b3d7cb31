//! Versioned routing table.
//!
//! Holds one [`RoutingEntry`] per known node, the local node included. Remote
//! entries only ever move forward: an entry replaces the stored one only when
//! its version is strictly greater. The local entry is owned by connection
//! membership and changes through [`RoutingTable::add_neighbor`] and
//! [`RoutingTable::remove_neighbor`], each of which bumps the local version.
//! When a peer turns out to hold a copy of the local entry at a version the
//! node has not reached (it restarted and started counting from zero again),
//! [`RoutingTable::supersede_local`] moves the local version past it.
//!
//! Remote entries that can no longer be reached by following advertised
//! links from the local node are dropped by [`RoutingTable::prune_unreachable`].
//!
//! Storage is a [`DashMap`], so updates lock a single shard and concurrent
//! connection tasks never contend on one global lock. Every change is
//! published on a `watch` channel that gossip tasks use to trigger
//! re-advertisement.

use crate::core::message::{Neighbor, NodeVersion, RoutingEntry};
use crate::core::node_id::NodeId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    entries: DashMap<NodeId, RoutingEntry>,
    changes: watch::Sender<u64>,
}

impl RoutingTable {
    /// New table holding only the local entry, at version 0 with no neighbours.
    pub fn new(local_id: NodeId) -> Self {
        let entries = DashMap::new();
        entries.insert(
            local_id.clone(),
            RoutingEntry::new(local_id.clone(), 0, Vec::new()),
        );
        let (changes, _) = watch::channel(0);
        Self {
            local_id,
            entries,
            changes,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Store `entry` if it is newer than what is held for that node.
    ///
    /// Returns whether the table changed. Entries for the local node are
    /// always refused.
    pub fn upsert(&self, entry: RoutingEntry) -> bool {
        if entry.id == self.local_id {
            trace!("Ignoring remote copy of local entry");
            return false;
        }

        let changed = match self.entries.entry(entry.id.clone()) {
            Entry::Occupied(mut current) => {
                if entry.version > current.get().version {
                    debug!(
                        node = %entry.id,
                        from = current.get().version,
                        to = entry.version,
                        "Routing entry updated"
                    );
                    current.insert(entry);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                debug!(node = %entry.id, version = entry.version, "Routing entry learnt");
                slot.insert(entry);
                true
            }
        };

        if changed {
            self.publish();
        }
        changed
    }

    pub fn get(&self, id: &NodeId) -> Option<RoutingEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    pub fn version_of(&self, id: &NodeId) -> Option<i32> {
        self.entries.get(id).map(|e| e.version)
    }

    /// Snapshot of every entry, ordered by node id.
    pub fn all_entries(&self) -> Vec<RoutingEntry> {
        let mut entries: Vec<RoutingEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    pub fn local_version(&self) -> i32 {
        self.version_of(&self.local_id).unwrap_or(0)
    }

    pub fn local_entry(&self) -> RoutingEntry {
        self.get(&self.local_id)
            .unwrap_or_else(|| RoutingEntry::new(self.local_id.clone(), 0, Vec::new()))
    }

    /// Record a direct link to `id`, or refresh its latency. Returns the new
    /// local version.
    pub fn add_neighbor(&self, id: NodeId, latency: i32) -> i32 {
        let version = {
            let mut local = self.local_mut();
            match local.neighbors.binary_search_by(|n| n.id.cmp(&id)) {
                Ok(i) => local.neighbors[i].latency = latency,
                Err(i) => local.neighbors.insert(i, Neighbor::new(id.clone(), latency)),
            }
            local.version = local.version.wrapping_add(1);
            local.version
        };
        debug!(neighbor = %id, latency, version, "Neighbour added");
        self.publish();
        version
    }

    /// Drop the direct link to `id`. Returns the new local version, or `None`
    /// when `id` was not a neighbour.
    pub fn remove_neighbor(&self, id: &NodeId) -> Option<i32> {
        let version = {
            let mut local = self.local_mut();
            let i = local.neighbors.binary_search_by(|n| n.id.cmp(id)).ok()?;
            local.neighbors.remove(i);
            local.version = local.version.wrapping_add(1);
            local.version
        };
        debug!(neighbor = %id, version, "Neighbour removed");
        self.publish();
        Some(version)
    }

    /// Move the local version past `seen`, a version of the local entry still
    /// held somewhere in the mesh. Returns the new version, or `None` when the
    /// local entry is already newer than `seen`.
    pub fn supersede_local(&self, seen: i32) -> Option<i32> {
        let version = {
            let mut local = self.local_mut();
            if local.version > seen {
                return None;
            }
            local.version = seen.wrapping_add(1);
            local.version
        };
        debug!(seen, version, "Local entry superseded");
        self.publish();
        Some(version)
    }

    /// Drop remote entries that cannot be reached from the local node by
    /// following advertised neighbour links. Returns how many were removed.
    ///
    /// Removal is not published: it never gives a peer anything new to learn.
    pub fn prune_unreachable(&self) -> usize {
        let mut reached = HashSet::new();
        let mut queue = VecDeque::from([self.local_id.clone()]);
        reached.insert(self.local_id.clone());
        while let Some(id) = queue.pop_front() {
            for neighbor in self.neighbors_of(&id) {
                if reached.insert(neighbor.id.clone()) {
                    queue.push_back(neighbor.id);
                }
            }
        }

        let unreachable: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|e| !reached.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for id in &unreachable {
            self.entries.remove(id);
            debug!(node = %id, "Unreachable routing entry dropped");
        }
        unreachable.len()
    }

    /// (id, version) of every entry, the local one included, ordered by id.
    pub fn summary(&self) -> Vec<NodeVersion> {
        let mut nodes: Vec<NodeVersion> = self
            .entries
            .iter()
            .map(|e| NodeVersion {
                id: e.key().clone(),
                version: e.version,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Full entries for the requested ids; unknown ids are skipped.
    pub fn details(&self, ids: &[NodeId]) -> Vec<RoutingEntry> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Advertised neighbours of `id`; empty when `id` is unknown.
    pub fn neighbors_of(&self, id: &NodeId) -> Vec<Neighbor> {
        self.entries
            .get(id)
            .map(|e| e.neighbors.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receiver that wakes on every table change. The current state counts as seen.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn local_mut(&self) -> dashmap::mapref::one::RefMut<'_, NodeId, RoutingEntry> {
        self.entries
            .entry(self.local_id.clone())
            .or_insert_with(|| RoutingEntry::new(self.local_id.clone(), 0, Vec::new()))
    }

    fn publish(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, version: i32, neighbors: &[(&str, i32)]) -> RoutingEntry {
        RoutingEntry::new(
            NodeId::from(id),
            version,
            neighbors
                .iter()
                .map(|(n, l)| Neighbor::new(NodeId::from(*n), *l))
                .collect(),
        )
    }

    #[test]
    fn test_local_entry_present_at_zero() {
        let table = RoutingTable::new(NodeId::from("L"));
        assert_eq!(table.local_version(), 0);
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.summary(),
            vec![NodeVersion { id: NodeId::from("L"), version: 0 }]
        );
    }

    #[test]
    fn test_supersede_local_moves_past_stale_copy() {
        let table = RoutingTable::new(NodeId::from("L"));
        table.add_neighbor(NodeId::from("P"), 3);
        let mut rx = table.subscribe();

        assert_eq!(table.supersede_local(0), None);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(table.supersede_local(7), Some(8));
        assert!(rx.has_changed().unwrap());
        let local = table.local_entry();
        assert_eq!(local.version, 8);
        assert_eq!(local.neighbors, vec![Neighbor::new(NodeId::from("P"), 3)]);

        // equal versions also move forward
        assert_eq!(table.supersede_local(8), Some(9));
    }

    #[test]
    fn test_prune_drops_only_unreachable() {
        let table = RoutingTable::new(NodeId::from("L"));
        table.add_neighbor(NodeId::from("P"), 1);
        table.upsert(entry("P", 2, &[("L", 1), ("X", 4)]));
        table.upsert(entry("X", 1, &[("P", 4)]));
        // gone lists P, but nobody lists gone
        table.upsert(entry("gone", 9, &[("P", 1)]));
        table.upsert(entry("island", 1, &[]));

        assert_eq!(table.prune_unreachable(), 2);
        let ids: Vec<_> = table.all_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![NodeId::from("L"), NodeId::from("P"), NodeId::from("X")]);
        assert_eq!(table.prune_unreachable(), 0);

        table.remove_neighbor(&NodeId::from("P"));
        assert_eq!(table.prune_unreachable(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_upsert_requires_strictly_greater() {
        let table = RoutingTable::new(NodeId::from("L"));
        assert!(table.upsert(entry("X", 2, &[("Y", 1)])));
        assert!(!table.upsert(entry("X", 2, &[("Z", 9)])));
        assert!(!table.upsert(entry("X", 1, &[])));
        assert_eq!(table.get(&NodeId::from("X")).unwrap().neighbors[0].id, NodeId::from("Y"));
        assert!(table.upsert(entry("X", 3, &[])));
        assert_eq!(table.version_of(&NodeId::from("X")), Some(3));
    }

    #[test]
    fn test_upsert_refuses_local_id() {
        let table = RoutingTable::new(NodeId::from("L"));
        assert!(!table.upsert(entry("L", 99, &[("X", 1)])));
        assert_eq!(table.local_version(), 0);
    }

    #[test]
    fn test_neighbor_membership_bumps_version() {
        let table = RoutingTable::new(NodeId::from("L"));
        assert_eq!(table.add_neighbor(NodeId::from("c"), 5), 1);
        assert_eq!(table.add_neighbor(NodeId::from("a"), 7), 2);
        let ids: Vec<_> = table
            .local_entry()
            .neighbors
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![NodeId::from("a"), NodeId::from("c")]);

        assert_eq!(table.remove_neighbor(&NodeId::from("a")), Some(3));
        assert_eq!(table.remove_neighbor(&NodeId::from("a")), None);
        assert_eq!(table.local_version(), 3);
    }

    #[test]
    fn test_details_omit_unknown() {
        let table = RoutingTable::new(NodeId::from("L"));
        table.upsert(entry("X", 1, &[]));
        let details = table.details(&[NodeId::from("X"), NodeId::from("gone")]);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].id, NodeId::from("X"));
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let table = RoutingTable::new(NodeId::from("L"));
        let mut rx = table.subscribe();
        assert!(!rx.has_changed().unwrap());

        table.upsert(entry("X", 1, &[]));
        rx.changed().await.unwrap();

        table.upsert(entry("X", 1, &[]));
        assert!(!rx.has_changed().unwrap());

        table.add_neighbor(NodeId::from("X"), 3);
        assert!(rx.has_changed().unwrap());
    }
}
