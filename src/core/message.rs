//! Peer message set.
//!
//! The set is closed: every consumer matches on [`Message`] exhaustively, and a
//! new wire tag means a new variant here plus a codec arm, nothing else.

use crate::core::node_id::NodeId;

/// Wire tags, one per message variant.
pub mod tags {
    pub const PING: u8 = 0;
    pub const PONG: u8 = 1;

    pub const DATA: u8 = 2;
    pub const DATA_ACK: u8 = 3;
    pub const DATA_REJECT: u8 = 4;

    pub const OK: u8 = 10;
    pub const REJECT: u8 = 11;

    pub const HELLO: u8 = 12;
    pub const SELECT: u8 = 13;

    pub const AUTH: u8 = 14;
    pub const AUTH_DATA: u8 = 15;

    pub const BEGIN: u8 = 16;
    pub const BYE: u8 = 17;

    pub const NODE_SUMMARY: u8 = 18;
    pub const NODE_REQUEST: u8 = 19;
    pub const NODE_DETAILS: u8 = 20;
}

/// One hop of a data message's path: the node it passed through and the
/// correlation id that node assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub node: NodeId,
    pub id: i32,
}

impl PathEntry {
    pub fn new(node: NodeId, id: i32) -> Self {
        Self { node, id }
    }
}

/// Summary line in a NodeSummary: which version of a node's routing the sender holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVersion {
    pub id: NodeId,
    pub version: i32,
}

/// Latency from some node to one of its neighbours, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub id: NodeId,
    pub latency: i32,
}

impl Neighbor {
    pub fn new(id: NodeId, latency: i32) -> Self {
        Self { id, latency }
    }
}

/// Full routing information for one node, as held in the routing table and
/// carried by NodeDetails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub id: NodeId,
    /// Bumped by the owning node whenever its neighbour set changes.
    pub version: i32,
    /// Ordered by neighbour id.
    pub neighbors: Vec<Neighbor>,
}

impl RoutingEntry {
    pub fn new(id: NodeId, version: i32, mut neighbors: Vec<Neighbor>) -> Self {
        neighbors.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            id,
            version,
            neighbors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Liveness probe on an established connection
    Ping,
    /// Reply to [`Message::Ping`]
    Pong,

    /// Application data travelling toward `target`
    Data {
        target: NodeId,
        message_type: String,
        payload: Vec<u8>,
        /// Every node visited so far, including the originator
        path: Vec<PathEntry>,
    },
    /// The data message this hop tagged with `id` was consumed or acknowledged downstream
    DataAck { id: i32 },
    /// The data message this hop tagged with `id` could not be delivered
    DataReject { id: i32 },

    Ok,
    Reject,

    /// First message from the connecting side
    Hello {
        id: NodeId,
        capabilities: Vec<String>,
    },
    /// Reply to Hello with the capabilities picked from the offer
    Select {
        id: NodeId,
        capabilities: Vec<String>,
    },

    Auth { method: String, data: Vec<u8> },
    AuthData { data: Vec<u8> },

    Begin,
    Bye,

    NodeSummary {
        own_version: i32,
        nodes: Vec<NodeVersion>,
    },
    NodeRequest { nodes: Vec<NodeId> },
    NodeDetails { nodes: Vec<RoutingEntry> },
}

impl Message {
    /// Wire tag of this variant
    pub fn tag(&self) -> u8 {
        match self {
            Message::Ping => tags::PING,
            Message::Pong => tags::PONG,
            Message::Data { .. } => tags::DATA,
            Message::DataAck { .. } => tags::DATA_ACK,
            Message::DataReject { .. } => tags::DATA_REJECT,
            Message::Ok => tags::OK,
            Message::Reject => tags::REJECT,
            Message::Hello { .. } => tags::HELLO,
            Message::Select { .. } => tags::SELECT,
            Message::Auth { .. } => tags::AUTH,
            Message::AuthData { .. } => tags::AUTH_DATA,
            Message::Begin => tags::BEGIN,
            Message::Bye => tags::BYE,
            Message::NodeSummary { .. } => tags::NODE_SUMMARY,
            Message::NodeRequest { .. } => tags::NODE_REQUEST,
            Message::NodeDetails { .. } => tags::NODE_DETAILS,
        }
    }

    /// Variant name for logs and protocol-violation errors
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Data { .. } => "Data",
            Message::DataAck { .. } => "DataAck",
            Message::DataReject { .. } => "DataReject",
            Message::Ok => "Ok",
            Message::Reject => "Reject",
            Message::Hello { .. } => "Hello",
            Message::Select { .. } => "Select",
            Message::Auth { .. } => "Auth",
            Message::AuthData { .. } => "AuthData",
            Message::Begin => "Begin",
            Message::Bye => "Bye",
            Message::NodeSummary { .. } => "NodeSummary",
            Message::NodeRequest { .. } => "NodeRequest",
            Message::NodeDetails { .. } => "NodeDetails",
        }
    }
}
