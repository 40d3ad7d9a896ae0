//! Route probes and the reverse transport map.
//!
//! A probe travels toward its destination hop by hop over encrypted peer
//! sessions, gaining one hop and contracting its capacity at every
//! forwarding node. The destination returns it unmodified over a direct,
//! unframed TCP connection that the origin opened ahead of the forward
//! pass; the 10-byte token pairs the probe with that transport.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::addr::{OverlayAddr, ADDR_SIZE};
use crate::db::Db;
use crate::identity::Channel;
use crate::wire::{self, WireError, ROUTE_HEADER_SIZE};

/// Size of a probe token in bytes.
pub const TOKEN_SIZE: usize = 10;

/// Errors from probing.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no routing entry for destination {0}")]
    NoRoute(OverlayAddr),

    #[error("no reverse transport registered for token {0}")]
    UnknownToken(RouteToken),

    #[error("timed out waiting for the probe to return")]
    TimedOut,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// 10-byte random identifier correlating a probe with its reverse
/// transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteToken([u8; TOKEN_SIZE]);

impl RouteToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_SIZE];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    /// Create a token from raw bytes.
    pub fn from_bytes(bytes: [u8; TOKEN_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_SIZE] {
        &self.0
    }
}

impl fmt::Display for RouteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for RouteToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouteToken({})", self)
    }
}

/// A route probe.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    /// Destination the probe is headed for.
    pub destination: OverlayAddr,
    /// Token pairing the probe with its reverse transport.
    pub token: RouteToken,
    /// Minimum capacity over all hops observed so far; 0 until the first
    /// hop is appended.
    pub capacity: i64,
    /// Hops appended so far, origin side first.
    pub hops: Vec<OverlayAddr>,
}

impl Route {
    /// Create a fresh probe for `destination` with a random token.
    pub fn new(destination: OverlayAddr) -> Self {
        Self {
            destination,
            token: RouteToken::generate(),
            capacity: 0,
            hops: Vec::new(),
        }
    }
}

/// Append the local next hop toward the probe's destination.
///
/// The first hop initializes the probe capacity from the local channel
/// balance; every later hop can only contract it. Returns the appended
/// hop so the caller can forward the probe there.
pub fn append_local_hop(
    db: &Db,
    channels: &[Channel],
    route: &mut Route,
) -> Result<OverlayAddr, ProbeError> {
    let entry = db
        .routing_entry(route.destination)
        .copied()
        .ok_or(ProbeError::NoRoute(route.destination))?;

    if let Some(hop_node) = db.address_node(entry.next_hop) {
        let balance = channels
            .iter()
            .filter(|channel| channel.remote == hop_node)
            .map(|channel| channel.local_balance)
            .min();
        if let Some(balance) = balance {
            if route.hops.is_empty() || balance < route.capacity {
                route.capacity = balance;
            }
        }
    }

    route.hops.push(entry.next_hop);
    Ok(entry.next_hop)
}

/// Map from probe token to the transport used to return the probe.
///
/// The origin registers an outbound connection before forwarding; the
/// destination registers an inbound one on accept. Last writer wins on a
/// token collision, and every transport is removed exactly once, either
/// when the reply is emitted or when it is consumed.
#[derive(Default)]
pub struct DirectMap {
    conns: Mutex<HashMap<RouteToken, TcpStream>>,
}

impl DirectMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reverse transport for `token`.
    pub fn insert(&self, token: RouteToken, stream: TcpStream) {
        self.conns.lock().insert(token, stream);
    }

    /// Drop a registered transport, if any.
    pub fn discard(&self, token: &RouteToken) {
        self.conns.lock().remove(token);
    }

    fn take(&self, token: &RouteToken) -> Option<TcpStream> {
        self.conns.lock().remove(token)
    }

    /// Destination side: write the serialized probe back to its origin
    /// and drop the transport. A probe with no registered transport is
    /// dropped.
    pub fn deliver(&self, route: &Route) -> Result<(), ProbeError> {
        let Some(mut stream) = self.take(&route.token) else {
            warn!(token = %route.token, "no reverse transport for probe, dropping");
            return Ok(());
        };
        stream.write_all(&wire::encode_route(route))?;
        debug!(token = %route.token, hops = route.hops.len(), "probe returned to origin");
        Ok(())
    }

    /// Origin side: block until the probe comes back, then drop the
    /// transport. `timeout` bounds the wait; `None` waits indefinitely.
    pub fn receive(
        &self,
        token: &RouteToken,
        timeout: Option<Duration>,
    ) -> Result<Route, ProbeError> {
        let mut stream = self.take(token).ok_or(ProbeError::UnknownToken(*token))?;
        stream.set_read_timeout(timeout)?;

        let mut header = [0u8; ROUTE_HEADER_SIZE];
        stream.read_exact(&mut header).map_err(map_timeout)?;
        let hop_count = u16::from_le_bytes([header[0], header[1]]) as usize;

        let mut buf = header.to_vec();
        buf.resize(ROUTE_HEADER_SIZE + hop_count * ADDR_SIZE, 0);
        stream
            .read_exact(&mut buf[ROUTE_HEADER_SIZE..])
            .map_err(map_timeout)?;
        Ok(wire::decode_route(&buf)?)
    }
}

fn map_timeout(err: std::io::Error) -> ProbeError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => ProbeError::TimedOut,
        _ => ProbeError::Io(err),
    }
}
