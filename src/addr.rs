//! 32-bit overlay addresses.
//!
//! An overlay address is exactly four octets. It is ordered
//! lexicographically and doubles as a 32-bit path through the address
//! tree: bit 0 is the most significant bit of octet 0, bit 31 the least
//! significant bit of octet 3. Addresses are rendered in the familiar
//! dotted-quad form (`10.0.0.1`).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Size of an overlay address in bytes.
pub const ADDR_SIZE: usize = 4;

/// Number of bits in an overlay address (the depth of the address tree).
pub const ADDR_BITS: usize = 32;

/// Errors related to overlay address handling.
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("invalid address length: expected {ADDR_SIZE}, got {0}")]
    InvalidLength(usize),

    #[error("invalid address string: {0:?}")]
    InvalidFormat(String),
}

/// A 32-bit overlay address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayAddr([u8; ADDR_SIZE]);

impl OverlayAddr {
    /// Create an address from a 4-byte array.
    pub const fn from_bytes(bytes: [u8; ADDR_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create an address from a slice.
    pub fn from_slice(slice: &[u8]) -> Result<Self, AddrError> {
        if slice.len() != ADDR_SIZE {
            return Err(AddrError::InvalidLength(slice.len()));
        }
        let mut bytes = [0u8; ADDR_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Return the raw bytes.
    pub fn as_bytes(&self) -> &[u8; ADDR_SIZE] {
        &self.0
    }

    /// Return bit `index` of the address path (0 = MSB of octet 0).
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < ADDR_BITS);
        let byte = self.0[index / 8];
        byte & (0x80 >> (index % 8)) != 0
    }

    /// Expand the address into its 32-bit path.
    pub fn to_bits(self) -> [bool; ADDR_BITS] {
        let mut bits = [false; ADDR_BITS];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = self.bit(i);
        }
        bits
    }

    /// Reassemble an address from a 32-bit path.
    pub fn from_bits(bits: &[bool; ADDR_BITS]) -> Self {
        let mut bytes = [0u8; ADDR_SIZE];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 0x80 >> (i % 8);
            }
        }
        Self(bytes)
    }
}

impl fmt::Display for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Debug for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayAddr({})", self)
    }
}

impl FromStr for OverlayAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; ADDR_SIZE];
        let mut parts = s.split('.');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| AddrError::InvalidFormat(s.to_string()))?;
            *byte = part
                .parse()
                .map_err(|_| AddrError::InvalidFormat(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddrError::InvalidFormat(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_order_msb_first() {
        let addr = OverlayAddr::from_bytes([0x80, 0x00, 0x00, 0x01]);
        assert!(addr.bit(0));
        assert!(!addr.bit(1));
        assert!(!addr.bit(30));
        assert!(addr.bit(31));
    }

    #[test]
    fn test_bits_roundtrip() {
        let addr = OverlayAddr::from_bytes([0xde, 0xad, 0xbe, 0xef]);
        let bits = addr.to_bits();
        assert_eq!(OverlayAddr::from_bits(&bits), addr);
    }

    #[test]
    fn test_parse_and_display() {
        let addr: OverlayAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(addr.as_bytes(), &[10, 0, 0, 1]);
        assert_eq!(addr.to_string(), "10.0.0.1");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.0.0".parse::<OverlayAddr>().is_err());
        assert!("10.0.0.1.2".parse::<OverlayAddr>().is_err());
        assert!("10.0.0.256".parse::<OverlayAddr>().is_err());
        assert!("ten.0.0.1".parse::<OverlayAddr>().is_err());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let low = OverlayAddr::from_bytes([0, 0, 0, 1]);
        let high = OverlayAddr::from_bytes([0, 0, 1, 0]);
        assert!(low < high);
    }

    #[test]
    fn test_from_slice_length() {
        assert!(OverlayAddr::from_slice(&[1, 2, 3]).is_err());
        assert!(OverlayAddr::from_slice(&[1, 2, 3, 4]).is_ok());
    }
}
