//! Channel-graph identities and the identity service interface.
//!
//! The daemon never touches identity keys itself. Signing, signature
//! recovery, channel enumeration, and identity-to-network-address
//! resolution are all delegated to an external identity service (the
//! node's channel wallet). This module defines the 33-byte node
//! identifier and the trait through which that service is reached.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Size of a compressed channel-graph public key in bytes.
pub const NODE_ID_SIZE: usize = 33;

/// Size of a recoverable signature in bytes.
pub const SIGNATURE_SIZE: usize = 65;

/// Errors surfaced by identity handling and the identity service.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid node id length: expected {NODE_ID_SIZE}, got {0}")]
    InvalidLength(usize),

    #[error("invalid node id encoding: {0}")]
    InvalidEncoding(String),

    #[error("identity service unavailable: {0}")]
    Unavailable(String),

    #[error("identity service error: {0}")]
    Service(String),
}

/// 33-byte compressed public key identifying a channel-graph node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create a node id from a 33-byte array.
    pub const fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a node id from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, IdentityError> {
        if slice.len() != NODE_ID_SIZE {
            return Err(IdentityError::InvalidLength(slice.len()));
        }
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Shortened hex form for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short())
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// A payment channel between the local node and a direct counterparty.
#[derive(Clone, Debug)]
pub struct Channel {
    /// The counterparty's channel-graph identity.
    pub remote: NodeId,
    /// Spendable balance on our side of the channel, in minor currency units.
    pub local_balance: i64,
}

/// External identity service.
///
/// Implementations wrap whatever process holds the channel wallet; see
/// `rpc::RpcIdentityService` for the reference bridge. All signatures are
/// 65-byte recoverable signatures: verification yields the signer's
/// identity rather than taking it as input.
pub trait IdentityService: Send + Sync {
    /// The local node's channel-graph identity.
    fn local_node(&self) -> Result<NodeId, IdentityError>;

    /// All open channels with direct counterparties.
    fn channels(&self) -> Result<Vec<Channel>, IdentityError>;

    /// Channel-graph neighbors of an arbitrary node.
    fn node_neighbors(&self, node: &NodeId) -> Result<Vec<NodeId>, IdentityError>;

    /// Sign a message with the local identity key.
    fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_SIZE], IdentityError>;

    /// Verify a recoverable signature.
    ///
    /// Returns the recovered signer identity, or `None` when the signature
    /// is invalid or the signer is unknown to the channel graph.
    fn verify(
        &self,
        message: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<Option<NodeId>, IdentityError>;

    /// Dialable `host:port` strings for a node, in preference order.
    fn network_addresses(&self, node: &NodeId) -> Result<Vec<String>, IdentityError>;
}
