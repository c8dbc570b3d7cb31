//! # Error Types
//!
//! Error handling for the mesh protocol layer.
//!
//! Errors fall into three groups, and the group decides what happens to the
//! connection that produced them:
//!
//! ## Error Categories
//! - **Codec errors**: `MalformedMessage`, `UnknownMessage`, `OversizedMessage`.
//!   Always reported to the caller, never a panic. The connection that produced
//!   the bytes is closed.
//! - **Connection errors**: `ProtocolViolation`, `AuthRejected`, `CapabilityMismatch`,
//!   `ConnectionLost`. Fatal to that one connection only.
//! - **Forwarding errors**: `NoRoute`, `LoopDetected`, `DeliveryTimeout`. Answered with
//!   a DataReject chain back to the originator, never fatal to a connection.
//!
//! ## Example Usage
//! ```rust
//! use mesh_protocol::core::codec;
//! use mesh_protocol::error::ProtocolError;
//!
//! match codec::decode(&[0x18, 0x63]) {
//!     Err(ProtocolError::UnknownMessage(tag)) => assert_eq!(tag, 99),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use crate::core::node_id::NodeId;
use std::io;
use thiserror::Error;

/// Static error strings, kept in one place so error paths don't allocate.
pub mod constants {
    /// Codec errors
    pub const ERR_TRUNCATED: &str = "Message truncated";
    pub const ERR_EMPTY_PATH: &str = "Data message carries an empty path";

    /// Handshake errors
    pub const ERR_NO_COMMON_CAPABILITY: &str = "No common capability with peer";
    pub const ERR_UNOFFERED_CAPABILITY: &str = "Peer selected a capability that was not offered";
    pub const ERR_METHOD_UNSUPPORTED: &str = "Authentication method not supported";
    pub const ERR_AUTH_FAILED: &str = "Authentication failed";
    pub const ERR_PEER_REJECTED: &str = "Peer rejected authentication";

    /// Connection errors
    pub const ERR_PONG_TIMEOUT: &str = "No pong received within deadline";
    pub const ERR_STREAM_ENDED: &str = "Stream ended";
    pub const ERR_HANDSHAKE_INCOMPLETE: &str = "Connection closed during handshake";

    /// Synchronization errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// ProtocolError is the primary error type for all protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message tag: {0}")]
    UnknownMessage(i64),

    #[error("Message too large: {0} bytes buffered")]
    OversizedMessage(usize),

    #[error("Protocol violation in state {state}: unexpected {message}")]
    ProtocolViolation {
        state: &'static str,
        message: &'static str,
    },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Capability negotiation failed")]
    CapabilityMismatch,

    #[error("No route to {0}")]
    NoRoute(NodeId),

    #[error("Routing loop detected at {0}")]
    LoopDetected(NodeId),

    #[error("Delivery {0} timed out")]
    DeliveryTimeout(i32),

    #[error("Delivery to {0} was rejected")]
    DeliveryRejected(NodeId),

    #[error("Cannot send to {0}")]
    InvalidTarget(NodeId),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Peer {0} already has an established session")]
    DuplicateSession(NodeId),

    #[error("Outbound queue for {0} is full")]
    Backpressure(NodeId),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Synchronization primitive poisoned")]
    LockPoisoned,
}

impl ProtocolError {
    /// Whether this error tears down the connection it happened on.
    ///
    /// Forwarding-level failures are answered on the wire and leave the link up.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::NoRoute(_)
                | ProtocolError::LoopDetected(_)
                | ProtocolError::DeliveryTimeout(_)
                | ProtocolError::DeliveryRejected(_)
                | ProtocolError::InvalidTarget(_)
                | ProtocolError::Backpressure(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
