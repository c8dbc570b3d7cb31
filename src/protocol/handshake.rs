//! Connection state machine.
//!
//! One [`Connection`] per physical link, driven entirely by the messages fed
//! into it: it never touches a socket. The caller writes whatever
//! [`Outcome::Reply`] returns, routes [`Outcome::Session`] messages to gossip
//! and forwarding, and tears the link down on [`Outcome::Closed`] or an error.
//!
//! ```text
//! initiator                          responder
//!   Hello{id, caps}     ─────────▶
//!                       ◀─────────   Select{id, caps ∩ local}     (or Reject)
//!   Auth{method, data}  ─────────▶
//!                       ◀────────▶   AuthData ...                 (optional)
//!                       ◀─────────   Ok, Begin                    (or Reject)
//!   Begin               ─────────▶
//! ```
//!
//! Established requires Begin both sent and received on each side.

use crate::config::LivenessConfig;
use crate::core::message::Message;
use crate::core::node_id::NodeId;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::auth::{AuthExchange, AuthStep, Authenticator};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HelloExchanged,
    Authenticating,
    Established,
    Closed,
}

impl ConnectionState {
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::HelloExchanged => "HelloExchanged",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::Established => "Established",
            ConnectionState::Closed => "Closed",
        }
    }
}

/// Which end opened the link. The initiator sends Hello and authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What the caller should do after feeding a message in
#[derive(Debug)]
pub enum Outcome {
    /// Send these messages on this link, in order
    Reply(Vec<Message>),
    /// A message for an established session, to be handled by gossip or forwarding
    Session(Message),
    /// The link is finished. Send `farewell` if present, then close.
    /// `error` is `None` when the peer said Bye.
    Closed {
        farewell: Option<Message>,
        error: Option<ProtocolError>,
    },
}

pub struct Connection {
    role: Role,
    local_id: NodeId,
    capabilities: Vec<String>,
    authenticator: Arc<dyn Authenticator>,
    ping_interval: Duration,
    pong_timeout: Duration,

    state: ConnectionState,
    remote_id: Option<NodeId>,
    negotiated: Vec<String>,
    exchange: Option<Box<dyn AuthExchange>>,
    authenticated: bool,
    begin_sent: bool,
    begin_received: bool,

    started: Instant,
    latency: Option<Duration>,
    last_seen: Instant,
    ping_outstanding: Option<Instant>,
}

impl Connection {
    /// `capabilities` are in local preference order.
    pub fn new(
        role: Role,
        local_id: NodeId,
        capabilities: Vec<String>,
        authenticator: Arc<dyn Authenticator>,
        liveness: &LivenessConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            role,
            local_id,
            capabilities,
            authenticator,
            ping_interval: liveness.ping_interval,
            pong_timeout: liveness.pong_timeout,
            state: ConnectionState::Connecting,
            remote_id: None,
            negotiated: Vec::new(),
            exchange: None,
            authenticated: false,
            begin_sent: false,
            begin_received: false,
            started: now,
            latency: None,
            last_seen: now,
            ping_outstanding: None,
        }
    }

    /// Messages to send as soon as the link opens.
    pub fn start(&mut self) -> Vec<Message> {
        self.started = Instant::now();
        match self.role {
            Role::Initiator => {
                debug!(local = %self.local_id, "Sending Hello");
                vec![Message::Hello {
                    id: self.local_id.clone(),
                    capabilities: self.capabilities.clone(),
                }]
            }
            Role::Responder => Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Remote identity, known once Hello/Select has been exchanged
    pub fn remote_id(&self) -> Option<&NodeId> {
        self.remote_id.as_ref()
    }

    /// Capabilities both ends agreed on, in the responder's preference order
    pub fn negotiated(&self) -> &[String] {
        &self.negotiated
    }

    /// Handshake round-trip time in milliseconds, used as the link latency
    /// in the local routing entry. Zero until established.
    pub fn latency_ms(&self) -> i32 {
        self.latency
            .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
            .unwrap_or(0)
    }

    /// Close from the local side. Returns the Bye to send, if the link was still open.
    pub fn close(&mut self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        self.state = ConnectionState::Closed;
        Some(Message::Bye)
    }

    /// Feed one inbound message through the state machine.
    #[instrument(level = "debug", skip(self, message), fields(state = self.state.name(), message = message.name()))]
    pub fn handle(&mut self, message: Message) -> Result<Outcome> {
        if self.is_closed() {
            return Err(self.violation(&message));
        }
        self.last_seen = Instant::now();

        if let Message::Bye = message {
            debug!(remote = ?self.remote_id, "Peer said Bye");
            self.state = ConnectionState::Closed;
            return Ok(Outcome::Closed {
                farewell: None,
                error: None,
            });
        }

        match (self.state, self.role, message) {
            (ConnectionState::Connecting, Role::Responder, Message::Hello { id, capabilities }) => {
                Ok(self.on_hello(id, capabilities))
            }
            (ConnectionState::Connecting, Role::Initiator, Message::Select { id, capabilities }) => {
                self.on_select(id, capabilities)
            }
            (ConnectionState::Connecting, Role::Initiator, Message::Reject) => {
                warn!("Peer shares no capability with us");
                Ok(self.fail(None, ProtocolError::CapabilityMismatch))
            }
            (ConnectionState::HelloExchanged, Role::Responder, Message::Auth { method, data }) => {
                Ok(self.on_auth(&method, &data))
            }
            (ConnectionState::Authenticating, _, Message::AuthData { data }) if !self.authenticated => {
                match self.exchange.as_mut() {
                    Some(exchange) => {
                        let step = exchange.step(&data);
                        Ok(self.apply_step(step))
                    }
                    None => Err(self.violation_named("AuthData")),
                }
            }
            (ConnectionState::Authenticating, _, Message::Ok) if !self.authenticated => {
                self.authenticated = true;
                self.exchange = None;
                self.begin_sent = true;
                debug!("Authentication accepted by peer");
                Ok(Outcome::Reply(vec![Message::Begin]))
            }
            (ConnectionState::Authenticating, _, Message::Reject) => {
                warn!("Peer rejected authentication");
                Ok(self.fail(
                    None,
                    ProtocolError::AuthRejected(constants::ERR_PEER_REJECTED.into()),
                ))
            }
            (ConnectionState::Authenticating, _, Message::Begin) if self.authenticated => {
                self.begin_received = true;
                self.check_established();
                Ok(Outcome::Reply(Vec::new()))
            }
            (ConnectionState::Established, _, Message::Ping) => {
                Ok(Outcome::Reply(vec![Message::Pong]))
            }
            (ConnectionState::Established, _, Message::Pong) => {
                self.ping_outstanding = None;
                Ok(Outcome::Reply(Vec::new()))
            }
            (
                ConnectionState::Established,
                _,
                message @ (Message::Data { .. }
                | Message::DataAck { .. }
                | Message::DataReject { .. }
                | Message::NodeSummary { .. }
                | Message::NodeRequest { .. }
                | Message::NodeDetails { .. }),
            ) => Ok(Outcome::Session(message)),
            (_, _, message) => Err(self.violation(&message)),
        }
    }

    /// Check keep-alive timers. Returns a Ping to send when the link has been
    /// idle for `ping_interval`, and fails with `ConnectionLost` once a Ping
    /// has gone unanswered for `pong_timeout`.
    pub fn poll_liveness(&mut self, now: Instant) -> Result<Option<Message>> {
        if !self.is_established() {
            return Ok(None);
        }

        if let Some(sent) = self.ping_outstanding {
            if now.saturating_duration_since(sent) >= self.pong_timeout {
                warn!(remote = ?self.remote_id, "Pong deadline missed");
                self.state = ConnectionState::Closed;
                return Err(ProtocolError::ConnectionLost(
                    constants::ERR_PONG_TIMEOUT.into(),
                ));
            }
            return Ok(None);
        }

        if now.saturating_duration_since(self.last_seen) >= self.ping_interval {
            self.ping_outstanding = Some(now);
            return Ok(Some(Message::Ping));
        }

        Ok(None)
    }

    fn on_hello(&mut self, id: NodeId, offered: Vec<String>) -> Outcome {
        if id == self.local_id {
            warn!("Refusing connection from our own id");
            return self.fail(Some(Message::Reject), ProtocolError::InvalidTarget(id));
        }

        let chosen: Vec<String> = self
            .capabilities
            .iter()
            .filter(|cap| offered.contains(cap))
            .cloned()
            .collect();

        if chosen.is_empty() {
            warn!(remote = %id, ?offered, "No common capability");
            return self.fail(Some(Message::Reject), ProtocolError::CapabilityMismatch);
        }

        debug!(remote = %id, capabilities = ?chosen, "Selected capabilities");
        self.remote_id = Some(id);
        self.negotiated = chosen.clone();
        self.state = ConnectionState::HelloExchanged;

        Outcome::Reply(vec![Message::Select {
            id: self.local_id.clone(),
            capabilities: chosen,
        }])
    }

    fn on_select(&mut self, id: NodeId, chosen: Vec<String>) -> Result<Outcome> {
        if chosen.is_empty() || !chosen.iter().all(|c| self.capabilities.contains(c)) {
            self.state = ConnectionState::Closed;
            warn!(remote = %id, ?chosen, "{}", constants::ERR_UNOFFERED_CAPABILITY);
            return Err(ProtocolError::ProtocolViolation {
                state: ConnectionState::Connecting.name(),
                message: "Select",
            });
        }

        self.remote_id = Some(id);
        self.negotiated = chosen;
        self.state = ConnectionState::HelloExchanged;

        let (data, exchange) = self.authenticator.initiate();
        self.exchange = Some(exchange);
        self.state = ConnectionState::Authenticating;

        Ok(Outcome::Reply(vec![Message::Auth {
            method: self.authenticator.method().to_string(),
            data,
        }]))
    }

    fn on_auth(&mut self, method: &str, data: &[u8]) -> Outcome {
        match self.authenticator.respond(method) {
            Some(mut exchange) => {
                self.state = ConnectionState::Authenticating;
                let step = exchange.step(data);
                self.exchange = Some(exchange);
                self.apply_step(step)
            }
            None => {
                warn!(method, "{}", constants::ERR_METHOD_UNSUPPORTED);
                self.fail(
                    Some(Message::Reject),
                    ProtocolError::AuthRejected(constants::ERR_METHOD_UNSUPPORTED.into()),
                )
            }
        }
    }

    fn apply_step(&mut self, step: AuthStep) -> Outcome {
        match step {
            AuthStep::Accept => {
                self.authenticated = true;
                self.exchange = None;
                self.begin_sent = true;
                debug!(remote = ?self.remote_id, "Authentication accepted");
                Outcome::Reply(vec![Message::Ok, Message::Begin])
            }
            AuthStep::Reject => {
                warn!(remote = ?self.remote_id, "{}", constants::ERR_AUTH_FAILED);
                self.fail(
                    Some(Message::Reject),
                    ProtocolError::AuthRejected(constants::ERR_AUTH_FAILED.into()),
                )
            }
            AuthStep::Continue(data) => Outcome::Reply(vec![Message::AuthData { data }]),
        }
    }

    fn check_established(&mut self) {
        if self.begin_sent && self.begin_received && self.authenticated {
            self.state = ConnectionState::Established;
            self.latency = Some(self.started.elapsed());
            self.last_seen = Instant::now();
            info!(
                remote = ?self.remote_id,
                capabilities = ?self.negotiated,
                latency_ms = self.latency_ms(),
                "Connection established"
            );
        }
    }

    fn fail(&mut self, farewell: Option<Message>, error: ProtocolError) -> Outcome {
        self.state = ConnectionState::Closed;
        Outcome::Closed {
            farewell,
            error: Some(error),
        }
    }

    fn violation(&mut self, message: &Message) -> ProtocolError {
        self.violation_named(message.name())
    }

    fn violation_named(&mut self, message: &'static str) -> ProtocolError {
        let state = self.state.name();
        warn!(state, message, "Protocol violation");
        self.state = ConnectionState::Closed;
        ProtocolError::ProtocolViolation { state, message }
    }
}
