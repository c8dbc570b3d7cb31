use crate::core::message::Message;

/// Component responsible for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Hello, Select, Auth, AuthData, Ok, Reject, Begin, Bye
    Handshake,
    /// Ping, Pong
    Liveness,
    /// NodeSummary, NodeRequest, NodeDetails
    Gossip,
    /// Data, DataAck, DataReject
    Forwarding,
}

/// Which component handles `msg`.
///
/// A new message variant does not compile until it has been given a route.
#[inline]
pub fn route(msg: &Message) -> Route {
    match msg {
        Message::Hello { .. }
        | Message::Select { .. }
        | Message::Auth { .. }
        | Message::AuthData { .. }
        | Message::Ok
        | Message::Reject
        | Message::Begin
        | Message::Bye => Route::Handshake,
        Message::Ping | Message::Pong => Route::Liveness,
        Message::NodeSummary { .. } | Message::NodeRequest { .. } | Message::NodeDetails { .. } => {
            Route::Gossip
        }
        Message::Data { .. } | Message::DataAck { .. } | Message::DataReject { .. } => {
            Route::Forwarding
        }
    }
}
