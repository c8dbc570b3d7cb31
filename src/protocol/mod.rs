//! # Connection Protocol
//!
//! Everything that happens on a single link before and around the session:
//! capability negotiation, authentication, Begin confirmation and keep-alive.
//!
//! ## Components
//! - **Auth**: pluggable authentication methods
//! - **Handshake**: the per-link [`Connection`](handshake::Connection) state machine
//! - **Dispatcher**: exhaustive mapping from message to owning component
//!
//! The state machine performs no I/O; `service::peer` drives it over a stream.

pub mod auth;
pub mod dispatcher;
pub mod handshake;
