//! # mesh-protocol
//!
//! Peer-to-peer wire protocol for mesh overlay networks.
//!
//! Nodes hold direct links to a few peers, learn the rest of the mesh through
//! routing gossip, and forward application data hop by hop toward targets
//! they are not directly connected to.
//!
//! ## Layers
//! - [`core`]: node ids, the closed message set and the CBOR wire codec
//! - [`protocol`]: per-link handshake/authentication state machine (sans-IO)
//! - [`routing`]: versioned routing table, gossip synchronisation and next-hop selection
//! - [`forwarding`]: multi-hop data forwarding with loop rejection and ack chaining (sans-IO)
//! - [`service`]: the Tokio runtime that drives all of the above over real streams
//!
//! ## Example
//! ```no_run
//! use mesh_protocol::config::MeshConfig;
//! use mesh_protocol::protocol::auth;
//! use mesh_protocol::MeshNode;
//!
//! # async fn run() -> mesh_protocol::error::Result<()> {
//! let config = MeshConfig::default();
//! let authenticator = auth::from_config(&config.node)?;
//! let (node, mut deliveries) = MeshNode::start(config, authenticator)?;
//!
//! let stream = tokio::net::TcpStream::connect("10.0.0.2:7000").await?;
//! let peer = node.connect(stream).await?;
//! node.send(peer, "chat", b"hello".to_vec()).await?;
//!
//! while let Some(delivery) = deliveries.recv().await {
//!     println!("{} sent {} bytes", delivery.source, delivery.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod forwarding;
pub mod protocol;
pub mod routing;
pub mod service;
pub mod utils;

pub use crate::core::message::{Message, Neighbor, NodeVersion, PathEntry, RoutingEntry};
pub use crate::core::node_id::NodeId;
pub use crate::error::{ProtocolError, Result};
pub use crate::forwarding::Delivery;
pub use crate::service::node::MeshNode;
pub use crate::service::registry::PeerEvent;
