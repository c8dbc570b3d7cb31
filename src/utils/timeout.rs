//! Timeout constants and async wrappers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Upper bound on a complete handshake.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time after which an established connection is probed with Ping.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// How long a Ping may stay unanswered before the link is declared dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodic gossip round.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(2);

/// Deadline for a forwarded or originated data message to be acknowledged.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often pending deliveries are checked against their deadlines.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Run `fut`, failing with [`ProtocolError::Timeout`] if it does not finish within `duration`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
