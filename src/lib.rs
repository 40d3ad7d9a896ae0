//! lar: overlay address routing for payment channel networks.
//!
//! Each participating node anchors a 32-bit overlay address on the
//! chain, keeps an encrypted session with every registered
//! payment-channel neighbor, and exchanges compact routing tables so any
//! node can discover a capacity-constrained multi-hop path to any
//! overlay address and deliver a route probe to it.
//!
//! Chain access and identity operations (signing, channel enumeration,
//! address resolution) live in external services reached through the
//! [`ChainService`] and [`IdentityService`] traits; `rpc` provides the
//! reference bridge client.

pub mod addr;
pub mod chain;
pub mod config;
pub mod db;
pub mod handshake;
pub mod history;
pub mod identity;
pub mod node;
pub mod peer;
pub mod probe;
pub mod protocol;
pub mod record;
pub mod rpc;
pub mod tree;
pub mod wire;

// Re-export the types a daemon embedding needs.
pub use addr::{AddrError, OverlayAddr, ADDR_BITS, ADDR_SIZE};
pub use chain::{Block, ChainError, ChainService, Registration, Transaction, TxOut};
pub use config::{Config, ConfigError, DEFAULT_PORT};
pub use db::{AbsorbOutcome, AddressEntry, Db, DbError, RegistrationError, RegistrationRecord};
pub use handshake::HandshakeError;
pub use history::{RouteSlot, RoutingEntry, RoutingHistory};
pub use identity::{
    Channel, IdentityError, IdentityService, NodeId, NODE_ID_SIZE, SIGNATURE_SIZE,
};
pub use node::{Node, NodeError};
pub use peer::{PeerSession, SessionContext, SessionError};
pub use probe::{DirectMap, ProbeError, Route, RouteToken, TOKEN_SIZE};
pub use protocol::{
    Destination, Message, MessageType, ProtocolError, CONN_TYPE_DESTINATION, CONN_TYPE_PEER,
};
pub use record::{RecordCipher, RecordError, Sequence, SessionSecret};
pub use rpc::{RpcChainService, RpcClient, RpcError, RpcIdentityService};
pub use tree::{AddressTree, EntryId, TreeError};
pub use wire::WireError;
