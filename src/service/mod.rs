//! # Service Layer
//!
//! Tokio runtime for a mesh node.
//!
//! ## Components
//! - **Node**: [`node::MeshNode`], the handle applications hold
//! - **Peer**: one task per established connection, driving the handshake
//!   state machine, gossip and forwarding over a framed stream
//! - **Registry**: established sessions and their outbound queues

pub mod node;
pub mod peer;
pub mod registry;
