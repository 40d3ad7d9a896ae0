//! Chain service interface and the registration scanner.
//!
//! Chain access (block height, block fetch) lives in an external service;
//! this module defines its interface and the thin scanner that recovers
//! address registrations from block data.
//!
//! A registration transaction has exactly two outputs. Output 0 carries
//! the envelope, output 1 is change. The output 0 script:
//!
//! | Offset | Field     | Size | Notes                                  |
//! |--------|-----------|------|----------------------------------------|
//! | 0      | marker    | 6    | `6a 4c 4c 6c 61 72` (OP_RETURN ‖       |
//! |        |           |      | OP_PUSHDATA1 ‖ len=76 ‖ ASCII "lar")   |
//! | 6      | version   | 4    | protocol version, big-endian           |
//! | 10     | address   | 4    | overlay address being registered       |
//! | 14     | signature | 65   | recoverable signature over the address |

use thiserror::Error;
use tracing::debug;

use crate::addr::{OverlayAddr, ADDR_SIZE};
use crate::identity::SIGNATURE_SIZE;

/// Marker prefix of a registration output script.
pub const REGISTRATION_SCRIPT_PREFIX: [u8; 6] = [0x6a, 0x4c, 0x4c, 0x6c, 0x61, 0x72];

/// Total length of a registration output script in bytes.
pub const REGISTRATION_SCRIPT_SIZE: usize =
    REGISTRATION_SCRIPT_PREFIX.len() + 4 + ADDR_SIZE + SIGNATURE_SIZE;

/// Protocol version this node emits and accepts.
pub const PROTOCOL_VERSION: u32 = 0;

/// Errors from the chain service.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain service unavailable: {0}")]
    Unavailable(String),

    #[error("chain service error: {0}")]
    Service(String),

    #[error("malformed block data: {0}")]
    Malformed(String),
}

/// One transaction output, script only.
#[derive(Clone, Debug)]
pub struct TxOut {
    /// Raw output script bytes.
    pub script: Vec<u8>,
}

/// One transaction, reduced to what the scanner needs.
#[derive(Clone, Debug)]
pub struct Transaction {
    /// Transaction id (hash).
    pub txid: [u8; 32],
    /// Outputs in order.
    pub outputs: Vec<TxOut>,
}

/// One block's transactions.
#[derive(Clone, Debug)]
pub struct Block {
    /// Transactions in block order.
    pub txs: Vec<Transaction>,
}

/// External chain service.
///
/// Implementations wrap a chain node; see `rpc::RpcChainService` for the
/// reference bridge.
pub trait ChainService: Send + Sync {
    /// Height of the best chain tip.
    fn block_count(&self) -> Result<u64, ChainError>;

    /// Block hash at a height.
    fn block_hash(&self, height: u64) -> Result<String, ChainError>;

    /// Fetch a block by hash.
    fn block(&self, hash: &str) -> Result<Block, ChainError>;
}

/// A candidate address registration recovered from the chain, not yet
/// verified.
#[derive(Clone, Debug)]
pub struct Registration {
    /// Overlay address being claimed.
    pub address: OverlayAddr,
    /// Height of the block carrying the registration.
    pub height: u64,
    /// Id of the registering transaction.
    pub txid: [u8; 32],
    /// Recoverable signature over the address bytes.
    pub signature: [u8; SIGNATURE_SIZE],
    /// Protocol version declared by the registrant.
    pub version: u32,
}

/// Parse a registration envelope out of an output script.
///
/// Returns `None` when the script is not a registration output.
pub fn parse_registration_script(
    script: &[u8],
) -> Option<(u32, OverlayAddr, [u8; SIGNATURE_SIZE])> {
    if script.len() != REGISTRATION_SCRIPT_SIZE || !script.starts_with(&REGISTRATION_SCRIPT_PREFIX)
    {
        return None;
    }
    let version = u32::from_be_bytes([script[6], script[7], script[8], script[9]]);
    let address = OverlayAddr::from_slice(&script[10..14]).ok()?;
    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&script[14..]);
    Some((version, address, signature))
}

/// Scan the block range `from..=to` for registration envelopes.
pub fn scan_registrations(
    chain: &dyn ChainService,
    from: u64,
    to: u64,
) -> Result<Vec<Registration>, ChainError> {
    let mut found = Vec::new();
    for height in from..=to {
        let hash = chain.block_hash(height)?;
        let block = chain.block(&hash)?;
        for tx in &block.txs {
            if tx.outputs.len() != 2 {
                continue;
            }
            let Some((version, address, signature)) =
                parse_registration_script(&tx.outputs[0].script)
            else {
                continue;
            };
            debug!(%address, height, "found registration envelope");
            found.push(Registration {
                address,
                height,
                txid: tx.txid,
                signature,
                version,
            });
        }
    }
    Ok(found)
}
