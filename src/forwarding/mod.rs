//! # Forwarding Engine
//!
//! Moves data messages hop by hop toward their target and chains the
//! acknowledgement back along the exact reverse path.
//!
//! Every hop appends `(own id, fresh correlation id)` to the message path and
//! remembers, under that id, who handed the message over and which id *they*
//! used. A DataAck or DataReject for the id is then relayed upstream with the
//! predecessor's id, without any further routing decision.
//!
//! ```text
//!  A ──Data[(A,0)]──▶ B ──Data[(A,0),(B,7)]──▶ T
//!  A ◀──DataAck{0}─── B ◀──────DataAck{7}───── T
//! ```
//!
//! The engine is sans-IO: every call returns [`Action`]s for the runtime to
//! carry out.

pub mod pending;

use crate::config::ForwardingConfig;
use crate::core::message::{Message, PathEntry};
use crate::core::node_id::NodeId;
use crate::error::{constants, ProtocolError, Result};
use crate::routing::strategy::NextHop;
use crate::routing::table::RoutingTable;
use crate::utils::metrics::Metrics;
use pending::{PendingDelivery, PendingTable, Upstream};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A data message in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEnvelope {
    pub target: NodeId,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub path: Vec<PathEntry>,
}

impl DataEnvelope {
    pub fn into_message(self) -> Message {
        Message::Data {
            target: self.target,
            message_type: self.message_type,
            payload: self.payload,
            path: self.path,
        }
    }
}

/// Payload that reached its target, handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Originator (first node on the path)
    pub source: NodeId,
    pub message_type: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Rejected,
    TimedOut,
}

/// Side effects requested by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Write `message` to the established connection with `to`
    Send { to: NodeId, message: Message },
    /// Hand a payload to the local application, then answer `from` with
    /// DataAck{id}, or DataReject{id} when the application cannot take it
    Deliver {
        delivery: Delivery,
        from: NodeId,
        id: i32,
    },
    /// A send originated here has finished
    Completed {
        correlation: i32,
        target: NodeId,
        outcome: DeliveryOutcome,
    },
}

impl Action {
    fn send(to: NodeId, message: Message) -> Self {
        Action::Send { to, message }
    }
}

pub struct Forwarder {
    local_id: NodeId,
    table: Arc<RoutingTable>,
    strategy: Arc<dyn NextHop>,
    pending: PendingTable,
    delivery_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Forwarder {
    pub fn new(
        table: Arc<RoutingTable>,
        strategy: Arc<dyn NextHop>,
        config: &ForwardingConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            local_id: table.local_id().clone(),
            table,
            strategy,
            pending: PendingTable::new(config.max_pending),
            delivery_timeout: config.delivery_timeout,
            metrics,
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Start a new delivery from this node. Returns the correlation id that
    /// identifies it in the eventual [`Action::Completed`], and the Send to perform.
    pub fn originate(
        &mut self,
        target: NodeId,
        message_type: String,
        payload: Vec<u8>,
        now: Instant,
    ) -> Result<(i32, Action)> {
        if target == self.local_id {
            return Err(ProtocolError::InvalidTarget(target));
        }

        let exclude: HashSet<NodeId> = std::iter::once(self.local_id.clone()).collect();
        let next_hop = self
            .strategy
            .next_hop(&self.table, &target, &exclude)
            .ok_or_else(|| ProtocolError::NoRoute(target.clone()))?;

        let correlation = self
            .pending
            .insert(PendingDelivery {
                upstream: Upstream::Local,
                next_hop: next_hop.clone(),
                target: target.clone(),
                deadline: now + self.delivery_timeout,
            })
            .ok_or_else(|| ProtocolError::Backpressure(target.clone()))?;

        debug!(%target, via = %next_hop, correlation, "Sending data");
        let envelope = DataEnvelope {
            target,
            message_type,
            payload,
            path: vec![PathEntry::new(self.local_id.clone(), correlation)],
        };
        Ok((correlation, Action::send(next_hop, envelope.into_message())))
    }

    /// Handle a Data message that arrived on the connection with `from`.
    ///
    /// Fails only for a malformed path; routing failures are answered with
    /// DataReject.
    pub fn on_data(
        &mut self,
        from: &NodeId,
        mut envelope: DataEnvelope,
        now: Instant,
    ) -> Result<Vec<Action>> {
        let last = envelope.path.last().ok_or_else(|| {
            ProtocolError::MalformedMessage(constants::ERR_EMPTY_PATH.to_string())
        })?;
        if &last.node != from {
            return Err(ProtocolError::MalformedMessage(format!(
                "Data path ends at {} but arrived from {from}",
                last.node
            )));
        }
        let upstream_id = last.id;

        if envelope.path.iter().any(|hop| hop.node == self.local_id) {
            warn!(target = %envelope.target, %from, "{}", ProtocolError::LoopDetected(self.local_id.clone()));
            self.metrics.loop_detected();
            return Ok(vec![Action::send(
                from.clone(),
                Message::DataReject { id: upstream_id },
            )]);
        }

        if envelope.target == self.local_id {
            let source = envelope.path[0].node.clone();
            debug!(%source, message_type = %envelope.message_type, "Data delivered");
            return Ok(vec![Action::Deliver {
                delivery: Delivery {
                    source,
                    message_type: envelope.message_type,
                    payload: envelope.payload,
                },
                from: from.clone(),
                id: upstream_id,
            }]);
        }

        let mut exclude: HashSet<NodeId> =
            envelope.path.iter().map(|hop| hop.node.clone()).collect();
        exclude.insert(self.local_id.clone());

        let Some(next_hop) = self.strategy.next_hop(&self.table, &envelope.target, &exclude)
        else {
            debug!(target = %envelope.target, "{}", ProtocolError::NoRoute(envelope.target.clone()));
            return Ok(vec![Action::send(
                from.clone(),
                Message::DataReject { id: upstream_id },
            )]);
        };

        let Some(correlation) = self.pending.insert(PendingDelivery {
            upstream: Upstream::Peer {
                node: from.clone(),
                correlation: upstream_id,
            },
            next_hop: next_hop.clone(),
            target: envelope.target.clone(),
            deadline: now + self.delivery_timeout,
        }) else {
            warn!(target = %envelope.target, "Pending delivery table full");
            return Ok(vec![Action::send(
                from.clone(),
                Message::DataReject { id: upstream_id },
            )]);
        };

        debug!(target = %envelope.target, %from, via = %next_hop, correlation, "Forwarding data");
        self.metrics.data_forwarded();
        envelope
            .path
            .push(PathEntry::new(self.local_id.clone(), correlation));
        Ok(vec![Action::send(next_hop, envelope.into_message())])
    }

    /// DataAck from `from` for the delivery this node tagged `id`.
    pub fn on_ack(&mut self, from: &NodeId, id: i32) -> Option<Action> {
        self.settle(from, id, DeliveryOutcome::Delivered)
    }

    /// DataReject from `from` for the delivery this node tagged `id`.
    pub fn on_reject(&mut self, from: &NodeId, id: i32) -> Option<Action> {
        self.settle(from, id, DeliveryOutcome::Rejected)
    }

    /// Fail a delivery whose Data could not be written to its next hop.
    pub fn fail(&mut self, id: i32) -> Option<Action> {
        let pending = self.pending.remove(id)?;
        Some(self.report(id, pending, DeliveryOutcome::Rejected))
    }

    /// Fail every delivery whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Action> {
        self.pending
            .expire(now)
            .into_iter()
            .map(|(id, pending)| {
                debug!(correlation = id, target = %pending.target, "{}", ProtocolError::DeliveryTimeout(id));
                self.metrics.delivery_timeout();
                self.report(id, pending, DeliveryOutcome::TimedOut)
            })
            .collect()
    }

    /// Fail every delivery routed through `peer`, whose connection is gone.
    pub fn drop_peer(&mut self, peer: &NodeId) -> Vec<Action> {
        self.pending
            .drain_via(peer)
            .into_iter()
            .map(|(id, pending)| self.report(id, pending, DeliveryOutcome::Rejected))
            .collect()
    }

    fn settle(&mut self, from: &NodeId, id: i32, outcome: DeliveryOutcome) -> Option<Action> {
        match self.pending.settle(id, from) {
            Some(pending) => Some(self.report(id, pending, outcome)),
            None => {
                debug!(%from, correlation = id, "Ignoring unmatched acknowledgement");
                None
            }
        }
    }

    fn report(&self, id: i32, pending: PendingDelivery, outcome: DeliveryOutcome) -> Action {
        match outcome {
            DeliveryOutcome::Delivered => self.metrics.data_acked(),
            DeliveryOutcome::Rejected | DeliveryOutcome::TimedOut => self.metrics.data_rejected(),
        }
        match pending.upstream {
            Upstream::Local => Action::Completed {
                correlation: id,
                target: pending.target,
                outcome,
            },
            Upstream::Peer { node, correlation } => {
                let message = match outcome {
                    DeliveryOutcome::Delivered => Message::DataAck { id: correlation },
                    DeliveryOutcome::Rejected | DeliveryOutcome::TimedOut => {
                        Message::DataReject { id: correlation }
                    }
                };
                Action::send(node, message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::Neighbor;
    use crate::routing::strategy::ShortestPath;
    use crate::core::message::RoutingEntry;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn forwarder(local: &str, neighbors: &[&str]) -> Forwarder {
        let table = Arc::new(RoutingTable::new(id(local)));
        for n in neighbors {
            table.add_neighbor(id(n), 1);
        }
        Forwarder::new(
            table,
            Arc::new(ShortestPath),
            &ForwardingConfig::default(),
            Arc::new(Metrics::new()),
        )
    }

    fn envelope(target: &str, path: &[(&str, i32)]) -> DataEnvelope {
        DataEnvelope {
            target: id(target),
            message_type: "t".into(),
            payload: vec![1],
            path: path.iter().map(|(n, c)| PathEntry::new(id(n), *c)).collect(),
        }
    }

    #[test]
    fn test_originate_to_self_is_invalid() {
        let mut f = forwarder("A", &["B"]);
        assert!(matches!(
            f.originate(id("A"), "t".into(), vec![], Instant::now()),
            Err(ProtocolError::InvalidTarget(_))
        ));
    }

    #[test]
    fn test_originate_without_route() {
        let mut f = forwarder("A", &[]);
        assert!(matches!(
            f.originate(id("Z"), "t".into(), vec![], Instant::now()),
            Err(ProtocolError::NoRoute(_))
        ));
    }

    #[test]
    fn test_deliver_at_target() {
        let mut f = forwarder("T", &["B"]);
        let actions = f
            .on_data(&id("B"), envelope("T", &[("A", 4), ("B", 9)]), Instant::now())
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::Deliver {
                delivery: Delivery {
                    source: id("A"),
                    message_type: "t".into(),
                    payload: vec![1],
                },
                from: id("B"),
                id: 9,
            }]
        );
    }

    #[test]
    fn test_loop_rejected_with_predecessor_id() {
        let mut f = forwarder("A", &["C"]);
        let actions = f
            .on_data(&id("C"), envelope("Z", &[("A", 0), ("B", 3), ("C", 8)]), Instant::now())
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::Send {
                to: id("C"),
                message: Message::DataReject { id: 8 }
            }]
        );
        assert!(f.pending().is_empty());
    }

    #[test]
    fn test_forward_appends_hop_and_relays_ack() {
        let mut f = forwarder("B", &["A", "C"]);
        f.table.upsert(RoutingEntry::new(id("C"), 1, vec![Neighbor::new(id("T"), 1)]));

        let actions = f
            .on_data(&id("A"), envelope("T", &[("A", 5)]), Instant::now())
            .unwrap();
        let assigned = match &actions[..] {
            [Action::Send {
                to,
                message: Message::Data { path, .. },
            }] => {
                assert_eq!(to, &id("C"));
                assert_eq!(path.len(), 2);
                assert_eq!(path[1].node, id("B"));
                path[1].id
            }
            other => panic!("unexpected {other:?}"),
        };

        // ack from the wrong neighbour is ignored
        assert_eq!(f.on_ack(&id("A"), assigned), None);
        assert_eq!(
            f.on_ack(&id("C"), assigned),
            Some(Action::Send {
                to: id("A"),
                message: Message::DataAck { id: 5 }
            })
        );
        assert!(f.pending().is_empty());
    }

    #[test]
    fn test_forward_without_route_rejects_upstream() {
        let mut f = forwarder("B", &["A"]);
        let actions = f
            .on_data(&id("A"), envelope("T", &[("A", 2)]), Instant::now())
            .unwrap();
        assert_eq!(
            actions,
            vec![Action::Send {
                to: id("A"),
                message: Message::DataReject { id: 2 }
            }]
        );
    }

    #[test]
    fn test_empty_path_is_malformed() {
        let mut f = forwarder("B", &["A"]);
        assert!(matches!(
            f.on_data(&id("A"), envelope("T", &[]), Instant::now()),
            Err(ProtocolError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_expire_reports_timeouts() {
        let mut f = forwarder("A", &["B"]);
        let start = Instant::now();
        let (correlation, _) = f.originate(id("B"), "t".into(), vec![], start).unwrap();

        assert!(f.expire(start).is_empty());
        let actions = f.expire(start + ForwardingConfig::default().delivery_timeout);
        assert_eq!(
            actions,
            vec![Action::Completed {
                correlation,
                target: id("B"),
                outcome: DeliveryOutcome::TimedOut
            }]
        );
    }

    #[test]
    fn test_drop_peer_fails_routed_deliveries() {
        let mut f = forwarder("A", &["B"]);
        let (correlation, _) = f
            .originate(id("B"), "t".into(), vec![], Instant::now())
            .unwrap();
        assert_eq!(
            f.drop_peer(&id("B")),
            vec![Action::Completed {
                correlation,
                target: id("B"),
                outcome: DeliveryOutcome::Rejected
            }]
        );
    }
}
