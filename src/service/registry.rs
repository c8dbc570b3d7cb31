//! Session registry: which peers currently have an established session, and
//! the queue that reaches each of them.
//!
//! Registration and removal are announced to subscribers as [`PeerEvent`]s.
//! After `Unavailable` a NodeId's old session is gone for good; a reconnect
//! registers a brand new session.

use crate::core::message::Message;
use crate::core::node_id::NodeId;
use crate::error::{ProtocolError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Available(NodeId),
    Unavailable(NodeId),
}

#[derive(Debug, Clone)]
struct PeerHandle {
    session: u64,
    outbound: mpsc::Sender<Message>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    peers: DashMap<NodeId, PeerHandle>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            peers: DashMap::new(),
            events,
        }
    }

    /// Register an established session. A NodeId holds at most one session.
    pub fn register(
        &self,
        id: NodeId,
        session: u64,
        outbound: mpsc::Sender<Message>,
    ) -> Result<()> {
        match self.peers.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ProtocolError::DuplicateSession(id)),
            Entry::Vacant(slot) => {
                slot.insert(PeerHandle { session, outbound });
            }
        }
        info!(peer = %id, session, "Peer available");
        let _ = self.events.send(PeerEvent::Available(id));
        Ok(())
    }

    /// Remove `id` if it is still registered under `session`. Returns whether
    /// anything was removed.
    pub fn unregister(&self, id: &NodeId, session: u64) -> bool {
        let removed = self
            .peers
            .remove_if(id, |_, handle| handle.session == session)
            .is_some();
        if removed {
            info!(peer = %id, session, "Peer unavailable");
            let _ = self.events.send(PeerEvent::Unavailable(id.clone()));
        }
        removed
    }

    /// Queue `message` for `to` without waiting.
    pub fn send(&self, to: &NodeId, message: Message) -> Result<()> {
        let outbound = self.sender(to).ok_or_else(|| ProtocolError::NoRoute(to.clone()))?;
        outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::Backpressure(to.clone()),
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Outbound queue of `id`, for callers that want to wait for capacity.
    pub fn sender(&self, id: &NodeId) -> Option<mpsc::Sender<Message>> {
        self.peers.get(id).map(|handle| handle.outbound.clone())
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Currently connected peers, ordered by id.
    pub fn connected(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        debug!("New peer event subscriber");
        self.events.subscribe()
    }
}
