//! Gossip synchronisation for one established connection.
//!
//! ```text
//!   NodeSummary{own, [(id, version)]}   ──▶   compare against local table
//!                                       ◀──   NodeRequest{[stale or unknown ids]}
//!   NodeDetails{[full entries]}         ──▶   upsert each
//! ```
//!
//! Each connection keeps an offer log: the highest version of each entry the
//! peer is known to hold, either because we offered it or because the peer
//! told or gave it to us. Summaries triggered by table changes only carry
//! entries newer than the log, which keeps a single update from bouncing
//! around the mesh. The log is cleared by every periodic full round, so a lost
//! message is repaired within one gossip interval.

use crate::core::message::{Message, NodeVersion, RoutingEntry};
use crate::core::node_id::NodeId;
use crate::routing::table::RoutingTable;
use std::collections::HashMap;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct GossipSync {
    peer: NodeId,
    offered: HashMap<NodeId, i32>,
}

impl GossipSync {
    pub fn new(peer: NodeId) -> Self {
        Self {
            peer,
            offered: HashMap::new(),
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// Periodic round: start a new suppression window and summarise every
    /// known entry.
    pub fn full_summary(&mut self, table: &RoutingTable) -> Message {
        self.offered.clear();
        let nodes = table.summary();
        for node in &nodes {
            self.offered.insert(node.id.clone(), node.version);
        }
        trace!(peer = %self.peer, entries = nodes.len(), "Full summary");
        Message::NodeSummary {
            own_version: table.local_version(),
            nodes,
        }
    }

    /// Summary of entries the peer has not yet been offered at their current
    /// version. `None` when there is nothing new for this peer.
    pub fn triggered_summary(&mut self, table: &RoutingTable) -> Option<Message> {
        let mut nodes = Vec::new();
        for node in table.summary() {
            if self.mark_offered(&node.id, node.version) {
                nodes.push(node);
            }
        }

        if nodes.is_empty() {
            return None;
        }
        trace!(peer = %self.peer, entries = nodes.len(), "Triggered summary");
        Some(Message::NodeSummary {
            own_version: table.local_version(),
            nodes,
        })
    }

    /// Compare a peer's summary with the table. Returns the NodeRequest to send
    /// back for every id that is unknown or held at a lower version.
    ///
    /// A listed copy of the local entry that is newer than the local version
    /// supersedes it instead.
    pub fn on_summary(&mut self, table: &RoutingTable, nodes: &[NodeVersion]) -> Option<Message> {
        let mut wanted = Vec::new();
        for node in nodes {
            self.mark_offered(&node.id, node.version);
            if node.id == *table.local_id() {
                if node.version > table.local_version() {
                    self.supersede(table, node.version);
                }
                continue;
            }
            let stale = table
                .version_of(&node.id)
                .map_or(true, |held| held < node.version);
            if stale && !wanted.contains(&node.id) {
                wanted.push(node.id.clone());
            }
        }

        if wanted.is_empty() {
            return None;
        }
        debug!(peer = %self.peer, count = wanted.len(), "Requesting routing details");
        Some(Message::NodeRequest { nodes: wanted })
    }

    /// Answer a NodeRequest. Ids that are no longer known are left out.
    pub fn on_request(&mut self, table: &RoutingTable, ids: &[NodeId]) -> Message {
        let nodes = table.details(ids);
        for entry in &nodes {
            self.mark_offered(&entry.id, entry.version);
        }
        Message::NodeDetails { nodes }
    }

    /// Apply NodeDetails to the table. Returns how many entries changed.
    pub fn on_details(&mut self, table: &RoutingTable, entries: Vec<RoutingEntry>) -> usize {
        let mut updated = 0;
        for entry in entries {
            self.mark_offered(&entry.id, entry.version);
            if entry.id == *table.local_id() {
                let local = table.local_entry();
                if entry.version > local.version
                    || (entry.version == local.version && entry.neighbors != local.neighbors)
                {
                    self.supersede(table, entry.version);
                }
                continue;
            }
            if table.upsert(entry) {
                updated += 1;
            }
        }
        if updated > 0 {
            debug!(peer = %self.peer, updated, "Applied routing details");
        }
        updated
    }

    fn supersede(&self, table: &RoutingTable, seen: i32) {
        if let Some(version) = table.supersede_local(seen) {
            debug!(peer = %self.peer, seen, version, "Peer held a newer copy of the local entry");
        }
    }

    /// Record that the peer holds `id` at `version`. Returns true if that is
    /// news, i.e. the log had nothing for `id` or only an older version.
    fn mark_offered(&mut self, id: &NodeId, version: i32) -> bool {
        match self.offered.get_mut(id) {
            Some(known) if *known >= version => false,
            Some(known) => {
                *known = version;
                true
            }
            None => {
                self.offered.insert(id.clone(), version);
                true
            }
        }
    }
}
