//! Fixed-layout record encoding.
//!
//! One place for every persisted and transmitted record layout. All
//! multi-byte integers here are little-endian; the record-layer message
//! envelope (big-endian type and counts) lives in `protocol`.
//!
//! | Record         | Size | Layout                                              |
//! |----------------|------|-----------------------------------------------------|
//! | block height   | 8    | `u64 height`                                        |
//! | address record | 81   | `[4]addr [33]node_id u64 height [32]txid u32 ver`   |
//! | routing record | 24   | `[4]dest [4]next_hop i64 capacity u64 height`       |
//! | destination    | 12   | `[4]addr i64 capacity`                              |
//! | route          | 24+  | `u16 hops [4]dest [10]token i64 capacity hops×[4]`  |

use thiserror::Error;

use crate::addr::{OverlayAddr, ADDR_SIZE};
use crate::db::RegistrationRecord;
use crate::history::RoutingEntry;
use crate::identity::{NodeId, NODE_ID_SIZE};
use crate::probe::{Route, RouteToken, TOKEN_SIZE};
use crate::protocol::Destination;

/// Size of the serialized block height header.
pub const BLOCK_HEIGHT_SIZE: usize = 8;

/// Size of one serialized address record.
pub const ADDRESS_RECORD_SIZE: usize = 81;

/// Size of one serialized routing record.
pub const ROUTING_RECORD_SIZE: usize = 24;

/// Size of one serialized shared destination.
pub const DESTINATION_SIZE: usize = 12;

/// Size of the fixed route header (hop count through capacity).
pub const ROUTE_HEADER_SIZE: usize = 24;

/// Errors from record decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("{kind} record length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{kind} record too short: expected at least {expected} bytes, got {got}")]
    ShortRecord {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
}

fn check_exact(kind: &'static str, expected: usize, got: usize) -> Result<(), WireError> {
    if got != expected {
        return Err(WireError::LengthMismatch {
            kind,
            expected,
            got,
        });
    }
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Encode the address log block height header.
pub fn encode_block_height(height: u64) -> [u8; BLOCK_HEIGHT_SIZE] {
    height.to_le_bytes()
}

/// Decode the address log block height header.
pub fn decode_block_height(bytes: &[u8]) -> Result<u64, WireError> {
    check_exact("block height", BLOCK_HEIGHT_SIZE, bytes.len())?;
    Ok(u64::from_le_bytes(read_array(bytes)))
}

/// Encode one address record.
pub fn encode_address_record(record: &RegistrationRecord) -> [u8; ADDRESS_RECORD_SIZE] {
    let mut buf = [0u8; ADDRESS_RECORD_SIZE];
    buf[0..4].copy_from_slice(record.address.as_bytes());
    buf[4..37].copy_from_slice(record.node_id.as_bytes());
    buf[37..45].copy_from_slice(&record.height.to_le_bytes());
    buf[45..77].copy_from_slice(&record.txid);
    buf[77..81].copy_from_slice(&record.version.to_le_bytes());
    buf
}

/// Decode one address record.
pub fn decode_address_record(bytes: &[u8]) -> Result<RegistrationRecord, WireError> {
    check_exact("address", ADDRESS_RECORD_SIZE, bytes.len())?;
    Ok(RegistrationRecord {
        address: OverlayAddr::from_bytes(read_array::<ADDR_SIZE>(&bytes[0..4])),
        node_id: NodeId::from_bytes(read_array::<NODE_ID_SIZE>(&bytes[4..37])),
        height: u64::from_le_bytes(read_array(&bytes[37..45])),
        txid: read_array(&bytes[45..77]),
        version: u32::from_le_bytes(read_array(&bytes[77..81])),
    })
}

/// Encode one routing record.
pub fn encode_routing_record(entry: &RoutingEntry) -> [u8; ROUTING_RECORD_SIZE] {
    let mut buf = [0u8; ROUTING_RECORD_SIZE];
    buf[0..4].copy_from_slice(entry.destination.as_bytes());
    buf[4..8].copy_from_slice(entry.next_hop.as_bytes());
    buf[8..16].copy_from_slice(&entry.capacity.to_le_bytes());
    buf[16..24].copy_from_slice(&entry.height.to_le_bytes());
    buf
}

/// Decode one routing record.
pub fn decode_routing_record(bytes: &[u8]) -> Result<RoutingEntry, WireError> {
    check_exact("routing", ROUTING_RECORD_SIZE, bytes.len())?;
    Ok(RoutingEntry {
        destination: OverlayAddr::from_bytes(read_array::<ADDR_SIZE>(&bytes[0..4])),
        next_hop: OverlayAddr::from_bytes(read_array::<ADDR_SIZE>(&bytes[4..8])),
        capacity: i64::from_le_bytes(read_array(&bytes[8..16])),
        height: u64::from_le_bytes(read_array(&bytes[16..24])),
    })
}

/// Encode one shared destination.
pub fn encode_destination(destination: &Destination) -> [u8; DESTINATION_SIZE] {
    let mut buf = [0u8; DESTINATION_SIZE];
    buf[0..4].copy_from_slice(destination.address.as_bytes());
    buf[4..12].copy_from_slice(&destination.capacity.to_le_bytes());
    buf
}

/// Decode one shared destination.
pub fn decode_destination(bytes: &[u8]) -> Result<Destination, WireError> {
    check_exact("destination", DESTINATION_SIZE, bytes.len())?;
    Ok(Destination {
        address: OverlayAddr::from_bytes(read_array::<ADDR_SIZE>(&bytes[0..4])),
        capacity: i64::from_le_bytes(read_array(&bytes[4..12])),
    })
}

/// Encode a route probe.
pub fn encode_route(route: &Route) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ROUTE_HEADER_SIZE + route.hops.len() * ADDR_SIZE);
    buf.extend_from_slice(&(route.hops.len() as u16).to_le_bytes());
    buf.extend_from_slice(route.destination.as_bytes());
    buf.extend_from_slice(route.token.as_bytes());
    buf.extend_from_slice(&route.capacity.to_le_bytes());
    for hop in &route.hops {
        buf.extend_from_slice(hop.as_bytes());
    }
    buf
}

/// Decode a route probe.
pub fn decode_route(bytes: &[u8]) -> Result<Route, WireError> {
    if bytes.len() < ROUTE_HEADER_SIZE {
        return Err(WireError::ShortRecord {
            kind: "route",
            expected: ROUTE_HEADER_SIZE,
            got: bytes.len(),
        });
    }
    let hop_count = u16::from_le_bytes(read_array(&bytes[0..2])) as usize;
    check_exact("route", ROUTE_HEADER_SIZE + hop_count * ADDR_SIZE, bytes.len())?;

    let mut hops = Vec::with_capacity(hop_count);
    for i in 0..hop_count {
        let offset = ROUTE_HEADER_SIZE + i * ADDR_SIZE;
        hops.push(OverlayAddr::from_bytes(read_array::<ADDR_SIZE>(
            &bytes[offset..offset + ADDR_SIZE],
        )));
    }
    Ok(Route {
        destination: OverlayAddr::from_bytes(read_array::<ADDR_SIZE>(&bytes[2..6])),
        token: RouteToken::from_bytes(read_array::<TOKEN_SIZE>(&bytes[6..16])),
        capacity: i64::from_le_bytes(read_array(&bytes[16..24])),
        hops,
    })
}
