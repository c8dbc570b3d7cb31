//! # Routing
//!
//! Mesh-wide view of who is connected to whom, and how it is kept in sync.
//!
//! ## Components
//! - **Table**: versioned per-node entries, shared by every connection
//! - **Gossip**: summary / request / details exchange per connection
//! - **Strategy**: pluggable next-hop selection over the table

pub mod gossip;
pub mod strategy;
pub mod table;

pub use gossip::GossipSync;
pub use strategy::{NextHop, ShortestPath};
pub use table::RoutingTable;
