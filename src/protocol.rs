//! Peer wire protocol messages.
//!
//! Messages travel inside record-layer frames. The envelope is a u16
//! big-endian message type; payload integers stay little-endian to match
//! the persisted record layouts.
//!
//! | Type          | id | Body                                          |
//! |---------------|----|-----------------------------------------------|
//! | TableRequest  | 0  | `u64 starting_block` (big-endian)             |
//! | TableResponse | 1  | `u16 count` (BE) ‖ count × destination (LE)   |
//! | ForwardRoute  | 2  | route (LE)                                    |
//!
//! A freshly accepted TCP connection carries a one-byte preamble before
//! any of this: [`CONN_TYPE_PEER`] enters the handshake and record layer,
//! [`CONN_TYPE_DESTINATION`] is a bare reverse probe transport.

use std::fmt;

use thiserror::Error;

use crate::addr::OverlayAddr;
use crate::probe::Route;
use crate::wire::{self, WireError, DESTINATION_SIZE};

/// Size of the message type envelope.
pub const MESSAGE_TYPE_SIZE: usize = 2;

/// Exact size of an encoded table request.
pub const TABLE_REQUEST_SIZE: usize = MESSAGE_TYPE_SIZE + 8;

/// Maximum destinations in one table response (the count is a u16).
pub const MAX_TABLE_ENTRIES: usize = u16::MAX as usize;

/// Connection preamble byte: peer session follows.
pub const CONN_TYPE_PEER: u8 = 0x00;

/// Connection preamble byte: reverse probe transport follows.
pub const CONN_TYPE_DESTINATION: u8 = 0x01;

/// Message type identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Ask a peer for its routing table.
    TableRequest = 0,
    /// Routing table share.
    TableResponse = 1,
    /// Route probe being forwarded toward its destination.
    ForwardRoute = 2,
}

impl MessageType {
    /// Try to convert from a wire value.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(MessageType::TableRequest),
            1 => Some(MessageType::TableResponse),
            2 => Some(MessageType::ForwardRoute),
            _ => None,
        }
    }

    /// Convert to the wire value.
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::TableRequest => "TableRequest",
            MessageType::TableResponse => "TableResponse",
            MessageType::ForwardRoute => "ForwardRoute",
        };
        write!(f, "{}", name)
    }
}

/// Errors from message encoding and decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(u16),

    #[error("message too short: expected at least {expected}, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("table request size mismatch: expected {TABLE_REQUEST_SIZE}, got {0}")]
    BadRequestSize(usize),

    #[error("table response carries {count} entries but {got} payload bytes")]
    CountMismatch { count: usize, got: usize },

    #[error("table response overflow: {0} entries")]
    TooManyEntries(usize),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// A destination and its capacity as shared with a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Destination {
    /// Destination overlay address.
    pub address: OverlayAddr,
    /// Known minimum capacity toward it, in minor currency units.
    pub capacity: i64,
}

/// A decoded peer message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Ask for every routing entry updated at or after `starting_block`.
    TableRequest { starting_block: u64 },
    /// The requested slice of the sender's routing table, newest first.
    TableResponse { destinations: Vec<Destination> },
    /// A probe to deliver or extend and pass on.
    ForwardRoute(Route),
}

impl Message {
    /// The message's wire type.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::TableRequest { .. } => MessageType::TableRequest,
            Message::TableResponse { .. } => MessageType::TableResponse,
            Message::ForwardRoute(_) => MessageType::ForwardRoute,
        }
    }

    /// Encode for the record layer.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = self.message_type().to_u16().to_be_bytes().to_vec();
        match self {
            Message::TableRequest { starting_block } => {
                buf.extend_from_slice(&starting_block.to_be_bytes());
            }
            Message::TableResponse { destinations } => {
                if destinations.len() > MAX_TABLE_ENTRIES {
                    return Err(ProtocolError::TooManyEntries(destinations.len()));
                }
                buf.extend_from_slice(&(destinations.len() as u16).to_be_bytes());
                for destination in destinations {
                    buf.extend_from_slice(&wire::encode_destination(destination));
                }
            }
            Message::ForwardRoute(route) => {
                buf.extend_from_slice(&wire::encode_route(route));
            }
        }
        Ok(buf)
    }

    /// Decode a record-layer payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < MESSAGE_TYPE_SIZE {
            return Err(ProtocolError::Truncated {
                expected: MESSAGE_TYPE_SIZE,
                got: bytes.len(),
            });
        }
        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let message_type =
            MessageType::from_u16(raw_type).ok_or(ProtocolError::UnknownType(raw_type))?;
        let body = &bytes[MESSAGE_TYPE_SIZE..];

        match message_type {
            MessageType::TableRequest => {
                if bytes.len() != TABLE_REQUEST_SIZE {
                    return Err(ProtocolError::BadRequestSize(bytes.len()));
                }
                let mut block = [0u8; 8];
                block.copy_from_slice(body);
                Ok(Message::TableRequest {
                    starting_block: u64::from_be_bytes(block),
                })
            }
            MessageType::TableResponse => {
                if body.len() < 2 {
                    return Err(ProtocolError::Truncated {
                        expected: MESSAGE_TYPE_SIZE + 2,
                        got: bytes.len(),
                    });
                }
                let count = u16::from_be_bytes([body[0], body[1]]) as usize;
                let payload = &body[2..];
                if payload.len() != count * DESTINATION_SIZE {
                    return Err(ProtocolError::CountMismatch {
                        count,
                        got: payload.len(),
                    });
                }
                let destinations = payload
                    .chunks_exact(DESTINATION_SIZE)
                    .map(wire::decode_destination)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Message::TableResponse { destinations })
            }
            MessageType::ForwardRoute => Ok(Message::ForwardRoute(wire::decode_route(body)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{RouteToken, TOKEN_SIZE};

    fn addr(last: u8) -> OverlayAddr {
        OverlayAddr::from_bytes([10, 0, 0, last])
    }

    #[test]
    fn test_message_type_roundtrip() {
        for ty in [
            MessageType::TableRequest,
            MessageType::TableResponse,
            MessageType::ForwardRoute,
        ] {
            assert_eq!(MessageType::from_u16(ty.to_u16()), Some(ty));
        }
        assert!(MessageType::from_u16(3).is_none());
        assert!(MessageType::from_u16(0xffff).is_none());
    }

    #[test]
    fn test_table_request_wire_form() {
        let message = Message::TableRequest { starting_block: 42 };
        let encoded = message.encode().unwrap();
        // Big-endian envelope and body.
        assert_eq!(encoded, vec![0, 0, 0, 0, 0, 0, 0, 0, 0, 42]);
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_table_response_roundtrip() {
        let message = Message::TableResponse {
            destinations: vec![
                Destination {
                    address: addr(2),
                    capacity: 500,
                },
                Destination {
                    address: addr(3),
                    capacity: -1,
                },
            ],
        };
        let encoded = message.encode().unwrap();
        assert_eq!(encoded.len(), MESSAGE_TYPE_SIZE + 2 + 2 * DESTINATION_SIZE);
        assert_eq!(&encoded[2..4], &[0, 2]);
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_empty_table_response() {
        let message = Message::TableResponse {
            destinations: Vec::new(),
        };
        let encoded = message.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_forward_route_roundtrip() {
        let message = Message::ForwardRoute(Route {
            destination: addr(9),
            token: RouteToken::from_bytes([5u8; TOKEN_SIZE]),
            capacity: 77,
            hops: vec![addr(2), addr(9)],
        });
        let encoded = message.encode().unwrap();
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert!(matches!(
            Message::decode(&[0, 9, 1, 2]),
            Err(ProtocolError::UnknownType(9))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_sizes() {
        assert!(matches!(
            Message::decode(&[0]),
            Err(ProtocolError::Truncated { .. })
        ));
        // Table request with a truncated block number.
        assert!(matches!(
            Message::decode(&[0, 0, 1, 2, 3]),
            Err(ProtocolError::BadRequestSize(5))
        ));
        // Response count claims one entry, carries none.
        assert!(matches!(
            Message::decode(&[0, 1, 0, 1]),
            Err(ProtocolError::CountMismatch { count: 1, got: 0 })
        ));
    }
}
