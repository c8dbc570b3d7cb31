//! Mesh node runtime.
//!
//! A [`MeshNode`] owns the routing table, the forwarding engine and the
//! session registry, and spawns one task per established connection. The
//! caller supplies already-connected byte streams; anything implementing
//! `AsyncRead + AsyncWrite` works, TCP helpers are provided for convenience.

use crate::config::MeshConfig;
use crate::core::message::Message;
use crate::core::node_id::NodeId;
use crate::error::{ProtocolError, Result};
use crate::forwarding::{Action, Delivery, DeliveryOutcome, Forwarder};
use crate::protocol::auth::Authenticator;
use crate::protocol::handshake::Role;
use crate::routing::strategy::{NextHop, ShortestPath};
use crate::routing::table::RoutingTable;
use crate::service::peer;
use crate::service::registry::{PeerEvent, SessionRegistry};
use crate::utils::metrics::Metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Forwarding engine plus the callers waiting on locally originated sends.
pub(crate) struct ForwardingState {
    pub(crate) forwarder: Forwarder,
    waiters: HashMap<i32, oneshot::Sender<Result<()>>>,
}

/// State shared by the node handle, the sweeper and every peer task.
pub(crate) struct NodeShared {
    pub(crate) id: NodeId,
    pub(crate) config: MeshConfig,
    pub(crate) authenticator: Arc<dyn Authenticator>,
    pub(crate) table: Arc<RoutingTable>,
    pub(crate) strategy: Arc<dyn NextHop>,
    pub(crate) registry: SessionRegistry,
    pub(crate) metrics: Arc<Metrics>,
    forwarding: Mutex<ForwardingState>,
    deliveries: mpsc::Sender<Delivery>,
    next_session: AtomicU64,
}

impl NodeShared {
    pub(crate) fn next_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `f` with the forwarding state locked. The lock is never held across
    /// an await point.
    pub(crate) fn forwarding<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ForwardingState) -> T,
    {
        let mut state = self
            .forwarding
            .lock()
            .map_err(|_| ProtocolError::LockPoisoned)?;
        Ok(f(&mut state))
    }

    /// Carry out forwarding actions, including any follow-ups they cause.
    ///
    /// Never waits on the application: a payload that does not fit in the
    /// delivery queue is rejected back to the sender.
    pub(crate) async fn apply(&self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Send { to, message } => {
                    let correlation = match &message {
                        Message::Data { path, .. } => path.last().map(|hop| hop.id),
                        _ => None,
                    };
                    if let Err(e) = self.registry.send(&to, message) {
                        warn!(peer = %to, error = %e, "Failed to queue message");
                        let Some(id) = correlation else { continue };
                        match self.forwarding(|state| state.forwarder.fail(id)) {
                            Ok(Some(follow_up)) => queue.push_back(follow_up),
                            Ok(None) => {}
                            Err(e) => error!(error = %e, "Forwarding state unavailable"),
                        }
                    }
                }
                Action::Deliver { delivery, from, id } => {
                    let reply = match self.deliveries.try_send(delivery) {
                        Ok(()) => {
                            self.metrics.data_delivered();
                            Message::DataAck { id }
                        }
                        Err(TrySendError::Full(delivery)) => {
                            warn!(source = %delivery.source, "Delivery queue full, rejecting");
                            Message::DataReject { id }
                        }
                        Err(TrySendError::Closed(_)) => {
                            warn!("Delivery receiver dropped, rejecting");
                            Message::DataReject { id }
                        }
                    };
                    queue.push_back(Action::Send {
                        to: from,
                        message: reply,
                    });
                }
                Action::Completed {
                    correlation,
                    target,
                    outcome,
                } => {
                    let waiter = match self.forwarding(|state| state.waiters.remove(&correlation)) {
                        Ok(waiter) => waiter,
                        Err(e) => {
                            error!(error = %e, "Forwarding state unavailable");
                            None
                        }
                    };
                    let result = match outcome {
                        DeliveryOutcome::Delivered => Ok(()),
                        DeliveryOutcome::Rejected => Err(ProtocolError::DeliveryRejected(target)),
                        DeliveryOutcome::TimedOut => Err(ProtocolError::DeliveryTimeout(correlation)),
                    };
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(result);
                    }
                }
            }
        }
    }
}

/// Handle to a running mesh node. Cheap to clone.
#[derive(Clone)]
pub struct MeshNode {
    shared: Arc<NodeShared>,
}

impl MeshNode {
    /// Start a node with shortest-path routing.
    ///
    /// Returns the node handle and the receiver for payloads addressed to this
    /// node. Must be called from within a Tokio runtime.
    pub fn start(
        config: MeshConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<(Self, mpsc::Receiver<Delivery>)> {
        Self::start_with_strategy(config, authenticator, Arc::new(ShortestPath))
    }

    /// Start a node with a custom next-hop strategy.
    pub fn start_with_strategy(
        config: MeshConfig,
        authenticator: Arc<dyn Authenticator>,
        strategy: Arc<dyn NextHop>,
    ) -> Result<(Self, mpsc::Receiver<Delivery>)> {
        config.validate_strict()?;
        let id = config.node.node_id()?;

        let metrics = Arc::new(Metrics::new());
        let table = Arc::new(RoutingTable::new(id.clone()));
        let forwarder = Forwarder::new(
            table.clone(),
            strategy.clone(),
            &config.forwarding,
            metrics.clone(),
        );
        let (deliveries, delivery_rx) = mpsc::channel(config.transport.outbound_queue);

        let shared = Arc::new(NodeShared {
            id: id.clone(),
            config,
            authenticator,
            table,
            strategy,
            registry: SessionRegistry::new(),
            metrics,
            forwarding: Mutex::new(ForwardingState {
                forwarder,
                waiters: HashMap::new(),
            }),
            deliveries,
            next_session: AtomicU64::new(1),
        });
        spawn_sweeper(&shared);

        info!(node = %id, "Mesh node started");
        Ok((Self { shared }, delivery_rx))
    }

    pub fn id(&self) -> &NodeId {
        &self.shared.id
    }

    /// Capabilities offered during handshakes, in preference order.
    pub fn capabilities(&self) -> &[String] {
        &self.shared.config.node.capabilities
    }

    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    /// Run the handshake as the connecting side over `stream`. Returns the
    /// remote node's id once the session is established.
    #[instrument(skip(self, stream), fields(local = %self.shared.id), level = "debug")]
    pub async fn connect<S>(&self, stream: S) -> Result<NodeId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        peer::establish(self.shared.clone(), stream, Role::Initiator).await
    }

    /// Run the handshake as the accepting side over `stream`.
    #[instrument(skip(self, stream), fields(local = %self.shared.id), level = "debug")]
    pub async fn accept<S>(&self, stream: S) -> Result<NodeId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        peer::establish(self.shared.clone(), stream, Role::Responder).await
    }

    /// Open a TCP connection to `addr` and handshake over it.
    pub async fn dial<A: ToSocketAddrs>(&self, addr: A) -> Result<NodeId> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.connect(stream).await
    }

    /// Accept TCP connections until `shutdown` fires (or its sender is
    /// dropped). Each accepted stream is handshaked on its own task.
    #[instrument(skip(self, listener, shutdown), fields(local = %self.shared.id))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Listening for peers");
        }
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Listener shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(%remote, error = %e, "Failed to set TCP_NODELAY");
                            }
                            let node = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = node.accept(stream).await {
                                    warn!(%remote, error = %e, "Inbound handshake failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                        }
                    }
                }
            }
        }
    }

    /// Send `payload` to `target` through the mesh and wait for the outcome.
    ///
    /// Resolves once the target acknowledged the message, or fails with
    /// `DeliveryRejected` when some hop could not deliver it and
    /// `DeliveryTimeout` when no answer arrived in time.
    #[instrument(skip(self, message_type, payload), fields(local = %self.shared.id), level = "debug")]
    pub async fn send(
        &self,
        target: NodeId,
        message_type: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let message_type = message_type.into();
        let action = self.shared.forwarding(|state| {
            let (correlation, action) =
                state
                    .forwarder
                    .originate(target, message_type, payload, Instant::now())?;
            state.waiters.insert(correlation, tx);
            Ok::<_, ProtocolError>(action)
        })??;
        self.shared.apply(vec![action]).await;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// Close the session with `peer` with a Bye.
    pub async fn disconnect(&self, peer: &NodeId) -> Result<()> {
        let outbound = self
            .shared
            .registry
            .sender(peer)
            .ok_or_else(|| ProtocolError::NoRoute(peer.clone()))?;
        outbound
            .send(Message::Bye)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close every session.
    pub async fn shutdown(&self) {
        info!(node = %self.shared.id, peers = self.shared.registry.len(), "Shutting down");
        for peer in self.shared.registry.connected() {
            if let Err(e) = self.disconnect(&peer).await {
                debug!(%peer, error = %e, "Peer already gone");
            }
        }
    }

    /// Peers with an established session, ordered by id.
    pub fn peers(&self) -> Vec<NodeId> {
        self.shared.registry.connected()
    }

    pub fn is_connected(&self, peer: &NodeId) -> bool {
        self.shared.registry.is_connected(peer)
    }

    pub fn subscribe_peers(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.registry.subscribe()
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.shared.table
    }

    /// Neighbour a message for `target` would be handed to right now.
    pub fn route_to(&self, target: &NodeId) -> Option<NodeId> {
        let exclude: HashSet<NodeId> = std::iter::once(self.shared.id.clone()).collect();
        self.shared
            .strategy
            .next_hop(&self.shared.table, target, &exclude)
    }

    /// Deliveries this node is still waiting on, its own and forwarded ones.
    pub fn pending_deliveries(&self) -> usize {
        self.shared
            .forwarding(|state| state.forwarder.pending().len())
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }
}

/// Periodically fail deliveries whose deadline passed. Stops once the node
/// and all of its sessions are gone.
fn spawn_sweeper(shared: &Arc<NodeShared>) {
    let node: Weak<NodeShared> = Arc::downgrade(shared);
    let period = shared.config.forwarding.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(shared) = node.upgrade() else {
                break;
            };
            match shared.forwarding(|state| state.forwarder.expire(Instant::now())) {
                Ok(actions) if actions.is_empty() => {}
                Ok(actions) => shared.apply(actions).await,
                Err(e) => {
                    error!(error = %e, "Delivery sweeper stopping");
                    break;
                }
            }
        }
        debug!("Delivery sweeper finished");
    });
}
