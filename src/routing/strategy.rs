//! Next-hop selection.
//!
//! The forwarding engine asks a [`NextHop`] strategy which direct neighbour a
//! data message should go to next. Strategies only read the routing table, so
//! any policy that works from advertised neighbour latencies can be plugged in.

use crate::core::node_id::NodeId;
use crate::routing::table::RoutingTable;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

pub trait NextHop: Send + Sync {
    /// Direct neighbour to hand a message for `target` to, never one of `exclude`.
    fn next_hop(
        &self,
        table: &RoutingTable,
        target: &NodeId,
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId>;
}

/// Lowest total advertised latency (Dijkstra from the local node).
///
/// Excluded nodes are never traversed, so the chosen route avoids every node
/// already on the message's path. Ties go to the smaller node id.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShortestPath;

impl NextHop for ShortestPath {
    fn next_hop(
        &self,
        table: &RoutingTable,
        target: &NodeId,
        exclude: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        let local = table.local_id();
        if target == local || exclude.contains(target) {
            return None;
        }

        let mut settled: HashSet<NodeId> = HashSet::new();
        settled.insert(local.clone());

        // (cost, node, first hop)
        let mut frontier = BinaryHeap::new();
        for neighbor in table.neighbors_of(local) {
            if !exclude.contains(&neighbor.id) {
                let cost = u64::try_from(neighbor.latency).unwrap_or(0);
                frontier.push(Reverse((cost, neighbor.id.clone(), neighbor.id)));
            }
        }

        while let Some(Reverse((cost, node, first_hop))) = frontier.pop() {
            if !settled.insert(node.clone()) {
                continue;
            }
            if &node == target {
                return Some(first_hop);
            }
            for neighbor in table.neighbors_of(&node) {
                if settled.contains(&neighbor.id) || exclude.contains(&neighbor.id) {
                    continue;
                }
                let step = u64::try_from(neighbor.latency).unwrap_or(0);
                frontier.push(Reverse((cost + step, neighbor.id, first_hop.clone())));
            }
        }

        None
    }
}
