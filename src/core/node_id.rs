//! NodeId: opaque identifier for a node in the mesh.
//!
//! Compared by exact byte equality. Displays as lowercase hex so ids read
//! the same in logs, errors and configuration files.

use bytes::Bytes;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Length of ids produced by [`NodeId::generate`].
pub const GENERATED_ID_LEN: usize = 16;

#[derive(Debug, Error, PartialEq)]
pub enum NodeIdError {
    #[error("Invalid node ID: empty")]
    Empty,
    #[error("Invalid node ID: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Identifier of a node in the mesh.
///
/// Backed by [`Bytes`] so cloning an id into paths, routing entries and
/// pending-delivery records is a reference-count bump.
///
/// # Examples
/// ```
/// use mesh_protocol::NodeId;
///
/// let id: NodeId = "a1b2c3".parse().unwrap();
/// assert_eq!(id.as_bytes(), &[0xa1, 0xb2, 0xc3]);
/// assert_eq!(id.to_string(), "a1b2c3");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Bytes);

impl NodeId {
    /// Generate a new random 16-byte id.
    pub fn generate() -> Self {
        use rand::Rng;
        let raw: [u8; GENERATED_ID_LEN] = rand::rng().random();
        Self(Bytes::copy_from_slice(&raw))
    }

    /// Wrap a static byte string (handy for fixtures).
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }

    /// Raw bytes as carried on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for NodeId {
    fn from(raw: Vec<u8>) -> Self {
        Self(Bytes::from(raw))
    }
}

impl From<&[u8]> for NodeId {
    fn from(raw: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(raw))
    }
}

impl From<&str> for NodeId {
    /// Uses the UTF-8 bytes of the string verbatim (not hex).
    fn from(raw: &str) -> Self {
        Self(Bytes::copy_from_slice(raw.as_bytes()))
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(NodeIdError::Empty);
        }
        Ok(Self::from(hex::decode(s)?))
    }
}
