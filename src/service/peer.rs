//! One task per peer connection.
//!
//! [`establish`] runs the handshake inline so the caller learns whether it
//! succeeded, then hands the framed stream to a spawned [`Session`] that
//! multiplexes inbound frames, the outbound queue, liveness checks and
//! gossip rounds until the link closes.

use crate::core::codec::WireCodec;
use crate::core::message::Message;
use crate::core::node_id::NodeId;
use crate::error::{constants, ProtocolError, Result};
use crate::forwarding::DataEnvelope;
use crate::protocol::dispatcher::{self, Route};
use crate::protocol::handshake::{Connection, Outcome, Role};
use crate::routing::gossip::GossipSync;
use crate::service::node::NodeShared;
use crate::utils::metrics::{Metrics, Timer};
use crate::utils::timeout::with_timeout_error;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

/// Handshake over `stream`, register the session and spawn its task.
#[instrument(skip(shared, stream), fields(local = %shared.id), level = "debug")]
pub(crate) async fn establish<S>(shared: Arc<NodeShared>, stream: S, role: Role) -> Result<NodeId>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _timer = Timer::start("handshake");
    shared.metrics.handshake_attempt();

    let mut framed = Framed::new(
        stream,
        WireCodec::new(shared.config.transport.max_message_size),
    );
    let mut conn = Connection::new(
        role,
        shared.id.clone(),
        shared.config.node.capabilities.clone(),
        shared.authenticator.clone(),
        &shared.config.liveness,
    );

    let handshake = handshake(&mut framed, &mut conn, &shared.metrics);
    if let Err(e) = with_timeout_error(handshake, shared.config.liveness.handshake_timeout).await {
        shared.metrics.handshake_failed();
        warn!(?role, error = %e, "Handshake failed");
        return Err(e);
    }

    let peer = conn.remote_id().cloned().ok_or(ProtocolError::ConnectionClosed)?;
    let session = shared.next_session();
    let (outbound, outbound_rx) = mpsc::channel(shared.config.transport.outbound_queue);

    if let Err(e) = shared.registry.register(peer.clone(), session, outbound) {
        shared.metrics.handshake_failed();
        warn!(%peer, error = %e, "Refusing second session");
        if let Some(bye) = conn.close() {
            let _ = framed.send(bye).await;
        }
        return Err(e);
    }

    shared.metrics.connection_established();
    let latency = conn.latency_ms();
    shared.table.add_neighbor(peer.clone(), latency);
    info!(%peer, session, latency_ms = latency, capabilities = ?conn.negotiated(), "Session established");

    let task = Session {
        gossip: GossipSync::new(peer.clone()),
        peer: peer.clone(),
        session,
        conn,
        framed,
        shared,
    };
    tokio::spawn(task.run(outbound_rx));

    Ok(peer)
}

async fn handshake<S>(
    framed: &mut Framed<S, WireCodec>,
    conn: &mut Connection,
    metrics: &Metrics,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for message in conn.start() {
        framed.send(message).await?;
        metrics.message_sent();
    }

    while !conn.is_established() {
        let message = framed.next().await.ok_or_else(|| {
            ProtocolError::ConnectionLost(constants::ERR_HANDSHAKE_INCOMPLETE.into())
        })??;
        metrics.message_received();

        match conn.handle(message)? {
            Outcome::Reply(replies) => {
                for reply in replies {
                    framed.send(reply).await?;
                    metrics.message_sent();
                }
            }
            Outcome::Closed { farewell, error } => {
                if let Some(farewell) = farewell {
                    let _ = framed.send(farewell).await;
                }
                return Err(error.unwrap_or_else(|| {
                    ProtocolError::ConnectionLost(constants::ERR_HANDSHAKE_INCOMPLETE.into())
                }));
            }
            Outcome::Session(message) => {
                return Err(ProtocolError::ProtocolViolation {
                    state: conn.state().name(),
                    message: message.name(),
                });
            }
        }
    }
    Ok(())
}

/// An established link with one peer.
struct Session<S> {
    peer: NodeId,
    session: u64,
    conn: Connection,
    gossip: GossipSync,
    framed: Framed<S, WireCodec>,
    shared: Arc<NodeShared>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self, outbound: mpsc::Receiver<Message>) {
        let result = self.drive(outbound).await;
        let shared = self.shared.clone();

        match &result {
            Ok(()) => info!(peer = %self.peer, session = self.session, "Session closed"),
            Err(e) => {
                if is_protocol_error(e) {
                    shared.metrics.protocol_error();
                } else {
                    shared.metrics.connection_error();
                }
                warn!(peer = %self.peer, session = self.session, error = %e, "Session ended");
            }
        }

        shared.table.remove_neighbor(&self.peer);
        match shared.forwarding(|state| state.forwarder.drop_peer(&self.peer)) {
            Ok(actions) => shared.apply(actions).await,
            Err(e) => warn!(error = %e, "Could not fail deliveries routed via peer"),
        }
        shared.registry.unregister(&self.peer, self.session);
        shared.metrics.connection_closed();
    }

    async fn drive(&mut self, mut outbound: mpsc::Receiver<Message>) -> Result<()> {
        let liveness = &self.shared.config.liveness;
        let tick = (liveness.ping_interval.min(liveness.pong_timeout) / 2)
            .max(Duration::from_millis(1));
        let mut keepalive = interval_at(Instant::now() + tick, tick);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let period = self.shared.config.gossip.interval;
        let mut gossip_round = interval_at(Instant::now() + period, period);
        gossip_round.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut changes = self.shared.table.subscribe();
        changes.borrow_and_update();

        let summary = self.gossip.full_summary(&self.shared.table);
        self.shared.metrics.gossip_summary();
        self.write(summary).await?;

        loop {
            tokio::select! {
                inbound = self.framed.next() => {
                    let message = inbound.ok_or_else(|| {
                        ProtocolError::ConnectionLost(constants::ERR_STREAM_ENDED.into())
                    })??;
                    self.shared.metrics.message_received();
                    match self.conn.handle(message)? {
                        Outcome::Reply(replies) => {
                            for reply in replies {
                                self.write(reply).await?;
                            }
                        }
                        Outcome::Session(message) => self.on_session(message).await?,
                        Outcome::Closed { farewell, error } => {
                            if let Some(farewell) = farewell {
                                let _ = self.write(farewell).await;
                            }
                            return error.map_or(Ok(()), Err);
                        }
                    }
                }
                queued = outbound.recv() => match queued {
                    Some(Message::Bye) | None => {
                        debug!(peer = %self.peer, "Closing session");
                        if let Some(bye) = self.conn.close() {
                            let _ = self.write(bye).await;
                        }
                        return Ok(());
                    }
                    Some(message) => self.write(message).await?,
                },
                _ = keepalive.tick() => {
                    if let Some(ping) = self.conn.poll_liveness(Instant::now())? {
                        self.write(ping).await?;
                    }
                }
                _ = gossip_round.tick() => {
                    self.shared.table.prune_unreachable();
                    let summary = self.gossip.full_summary(&self.shared.table);
                    self.shared.metrics.gossip_summary();
                    self.write(summary).await?;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if let Some(summary) = self.gossip.triggered_summary(&self.shared.table) {
                        self.shared.metrics.gossip_summary();
                        self.write(summary).await?;
                    }
                }
            }
        }
    }

    async fn on_session(&mut self, message: Message) -> Result<()> {
        match dispatcher::route(&message) {
            Route::Gossip => self.on_gossip(message).await,
            Route::Forwarding => self.on_forwarding(message).await,
            Route::Handshake | Route::Liveness => Err(ProtocolError::ProtocolViolation {
                state: self.conn.state().name(),
                message: message.name(),
            }),
        }
    }

    async fn on_gossip(&mut self, message: Message) -> Result<()> {
        let table = self.shared.table.clone();
        match message {
            Message::NodeSummary { nodes, .. } => {
                if let Some(request) = self.gossip.on_summary(&table, &nodes) {
                    self.shared.metrics.gossip_request();
                    self.write(request).await?;
                }
            }
            Message::NodeRequest { nodes } => {
                let details = self.gossip.on_request(&table, &nodes);
                self.write(details).await?;
            }
            Message::NodeDetails { nodes } => {
                let updated = self.gossip.on_details(&table, nodes);
                if updated > 0 {
                    self.shared.metrics.routing_updated(updated as u64);
                }
            }
            other => {
                return Err(ProtocolError::ProtocolViolation {
                    state: self.conn.state().name(),
                    message: other.name(),
                })
            }
        }
        Ok(())
    }

    async fn on_forwarding(&mut self, message: Message) -> Result<()> {
        let shared = self.shared.clone();
        let peer = &self.peer;
        let actions = match message {
            Message::Data {
                target,
                message_type,
                payload,
                path,
            } => {
                let envelope = DataEnvelope {
                    target,
                    message_type,
                    payload,
                    path,
                };
                shared.forwarding(|state| state.forwarder.on_data(peer, envelope, Instant::now()))??
            }
            Message::DataAck { id } => shared
                .forwarding(|state| state.forwarder.on_ack(peer, id))?
                .into_iter()
                .collect(),
            Message::DataReject { id } => shared
                .forwarding(|state| state.forwarder.on_reject(peer, id))?
                .into_iter()
                .collect(),
            other => {
                return Err(ProtocolError::ProtocolViolation {
                    state: self.conn.state().name(),
                    message: other.name(),
                })
            }
        };
        shared.apply(actions).await;
        Ok(())
    }

    async fn write(&mut self, message: Message) -> Result<()> {
        self.framed.send(message).await?;
        self.shared.metrics.message_sent();
        Ok(())
    }
}

fn is_protocol_error(error: &ProtocolError) -> bool {
    matches!(
        error,
        ProtocolError::MalformedMessage(_)
            | ProtocolError::UnknownMessage(_)
            | ProtocolError::OversizedMessage(_)
            | ProtocolError::ProtocolViolation { .. }
    )
}
