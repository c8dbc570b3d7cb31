//! In-flight delivery bookkeeping.
//!
//! Correlation ids are local to this node: each forwarded or originated data
//! message gets the next free non-negative int32, and the id is what the next
//! hop echoes back in DataAck/DataReject.

use crate::core::node_id::NodeId;
use std::collections::HashMap;
use tokio::time::Instant;

/// Where the outcome of a delivery must be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// Originated by this node
    Local,
    /// Forwarded on behalf of `node`, which tagged the message with `correlation`
    Peer { node: NodeId, correlation: i32 },
}

#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub upstream: Upstream,
    /// The only node whose Ack/Reject settles this delivery
    pub next_hop: NodeId,
    pub target: NodeId,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct PendingTable {
    next_id: i32,
    entries: HashMap<i32, PendingDelivery>,
    capacity: usize,
}

impl PendingTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
            capacity: capacity.clamp(1, i32::MAX as usize),
        }
    }

    /// Store `delivery` under a fresh correlation id. `None` when full.
    pub fn insert(&mut self, delivery: PendingDelivery) -> Option<i32> {
        if self.entries.len() >= self.capacity {
            return None;
        }
        let mut id = self.next_id;
        while self.entries.contains_key(&id) {
            id = Self::successor(id);
        }
        self.next_id = Self::successor(id);
        self.entries.insert(id, delivery);
        Some(id)
    }

    /// Remove and return the delivery for `id`, but only when `from` is the
    /// hop it was sent to.
    pub fn settle(&mut self, id: i32, from: &NodeId) -> Option<PendingDelivery> {
        match self.entries.get(&id) {
            Some(pending) if &pending.next_hop == from => self.entries.remove(&id),
            _ => None,
        }
    }

    pub fn remove(&mut self, id: i32) -> Option<PendingDelivery> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: i32) -> Option<&PendingDelivery> {
        self.entries.get(&id)
    }

    /// Remove every delivery whose deadline is at or before `now`, oldest id first.
    pub fn expire(&mut self, now: Instant) -> Vec<(i32, PendingDelivery)> {
        self.drain_where(|p| p.deadline <= now)
    }

    /// Remove every delivery that was sent through `peer`.
    pub fn drain_via(&mut self, peer: &NodeId) -> Vec<(i32, PendingDelivery)> {
        self.drain_where(|p| &p.next_hop == peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn drain_where<F>(&mut self, predicate: F) -> Vec<(i32, PendingDelivery)>
    where
        F: Fn(&PendingDelivery) -> bool,
    {
        let mut ids: Vec<i32> = self
            .entries
            .iter()
            .filter(|(_, p)| predicate(p))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p)))
            .collect()
    }

    fn successor(id: i32) -> i32 {
        if id == i32::MAX {
            0
        } else {
            id + 1
        }
    }
}
