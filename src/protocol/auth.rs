//! Authentication plug-ins.
//!
//! The connection state machine only relays bytes: it hands the initiator's
//! `Auth` data and every `AuthData` payload to an [`AuthExchange`] and acts on
//! the returned [`AuthStep`]. Schemes are supplied by an [`Authenticator`],
//! which is shared by all connections of a node and creates one exchange per
//! link.

use crate::config::{NodeConfig, AUTH_NONE, AUTH_TOKEN};
use crate::error::{ProtocolError, Result};
use std::sync::Arc;

/// Result of feeding one message into an exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Authentication succeeded; the evaluating side sends Ok
    Accept,
    /// Authentication failed; the evaluating side sends Reject
    Reject,
    /// Send these bytes as AuthData and wait for the reply
    Continue(Vec<u8>),
}

/// Per-connection state of one authentication run.
pub trait AuthExchange: Send {
    fn step(&mut self, data: &[u8]) -> AuthStep;
}

/// Factory for authentication exchanges.
pub trait Authenticator: Send + Sync {
    /// Method name sent in the Auth message
    fn method(&self) -> &str;

    /// Start authenticating toward a responder: the initial Auth data and the
    /// exchange that will handle any AuthData the responder sends back.
    fn initiate(&self) -> (Vec<u8>, Box<dyn AuthExchange>);

    /// Evaluate an incoming Auth for `method`. `None` means the method is not
    /// supported and the peer is rejected.
    fn respond(&self, method: &str) -> Option<Box<dyn AuthExchange>>;
}

/// Build the authenticator described by `[node] auth_method`.
pub fn from_config(config: &NodeConfig) -> Result<Arc<dyn Authenticator>> {
    match config.auth_method.as_str() {
        AUTH_NONE => Ok(Arc::new(NoAuth)),
        AUTH_TOKEN => {
            let token = config.auth_token.as_deref().unwrap_or_default();
            if token.is_empty() {
                return Err(ProtocolError::ConfigError(
                    "auth_token must be set when auth_method is 'token'".into(),
                ));
            }
            Ok(Arc::new(TokenAuth::new(token)))
        }
        other => Err(ProtocolError::ConfigError(format!(
            "Unknown auth method: '{other}'"
        ))),
    }
}

/// Accepts every peer that asks for method "none".
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn method(&self) -> &str {
        AUTH_NONE
    }

    fn initiate(&self) -> (Vec<u8>, Box<dyn AuthExchange>) {
        (Vec::new(), Box::new(NoChallenge))
    }

    fn respond(&self, method: &str) -> Option<Box<dyn AuthExchange>> {
        (method == AUTH_NONE).then(|| Box::new(AcceptAll) as Box<dyn AuthExchange>)
    }
}

/// Pre-shared token. The initiator sends the token as its Auth data and the
/// responder compares it in constant time.
#[derive(Clone)]
pub struct TokenAuth {
    token: Arc<[u8]>,
}

impl TokenAuth {
    pub fn new(token: impl AsRef<[u8]>) -> Self {
        Self {
            token: Arc::from(token.as_ref()),
        }
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth").finish_non_exhaustive()
    }
}

impl Authenticator for TokenAuth {
    fn method(&self) -> &str {
        AUTH_TOKEN
    }

    fn initiate(&self) -> (Vec<u8>, Box<dyn AuthExchange>) {
        (self.token.to_vec(), Box::new(NoChallenge))
    }

    fn respond(&self, method: &str) -> Option<Box<dyn AuthExchange>> {
        (method == AUTH_TOKEN).then(|| {
            Box::new(TokenCheck {
                expected: Arc::clone(&self.token),
            }) as Box<dyn AuthExchange>
        })
    }
}

struct AcceptAll;

impl AuthExchange for AcceptAll {
    fn step(&mut self, _data: &[u8]) -> AuthStep {
        AuthStep::Accept
    }
}

/// Initiator side of single-message schemes; any challenge is unexpected.
struct NoChallenge;

impl AuthExchange for NoChallenge {
    fn step(&mut self, _data: &[u8]) -> AuthStep {
        AuthStep::Reject
    }
}

struct TokenCheck {
    expected: Arc<[u8]>,
}

impl AuthExchange for TokenCheck {
    fn step(&mut self, data: &[u8]) -> AuthStep {
        if constant_time_eq(&self.expected, data) {
            AuthStep::Accept
        } else {
            AuthStep::Reject
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_auth_accepts_only_none() {
        let auth = NoAuth;
        let mut ex = auth.respond("none").unwrap();
        assert_eq!(ex.step(&[]), AuthStep::Accept);
        assert!(auth.respond("token").is_none());
    }

    #[test]
    fn test_token_auth() {
        let auth = TokenAuth::new("hunter2");
        let (data, _) = auth.initiate();
        assert_eq!(data, b"hunter2");

        let mut ok = auth.respond("token").unwrap();
        assert_eq!(ok.step(b"hunter2"), AuthStep::Accept);

        let mut bad = auth.respond("token").unwrap();
        assert_eq!(bad.step(b"hunter3"), AuthStep::Reject);
        assert_eq!(bad.step(b"hunter"), AuthStep::Reject);
    }

    #[test]
    fn test_from_config() {
        let mut config = NodeConfig::default();
        assert_eq!(from_config(&config).unwrap().method(), "none");

        config.auth_method = "token".into();
        assert!(from_config(&config).is_err());

        config.auth_token = Some("abc".into());
        assert_eq!(from_config(&config).unwrap().method(), "token");

        config.auth_method = "kerberos".into();
        assert!(matches!(
            from_config(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
