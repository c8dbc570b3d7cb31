//! # Core Protocol Components
//!
//! Identifiers, the peer message set and its wire encoding.
//!
//! ## Components
//! - **NodeId**: opaque byte identifier of a mesh node
//! - **Message**: closed sum type of every message a peer can send
//! - **Codec**: tag-prefixed CBOR encoding plus a Tokio codec for byte streams
//!
//! ## Wire Format
//! ```text
//! [tag: CBOR uint] [field 1: CBOR item] [field 2: CBOR item] ...
//! ```
//!
//! ## Security
//! - Streaming decode refuses to buffer more than `max_message_size` bytes
//! - Untrusted counts never drive allocation beyond the bytes actually present

pub mod codec;
pub mod message;
pub mod node_id;
