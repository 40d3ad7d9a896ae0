//! Peer sessions and the per-session service loops.
//!
//! Every established session runs two tasks: a read-dispatch loop that
//! decrypts inbound frames and serves them, and a periodic loop pulling
//! the peer's routing table. Both directions of a session advance the
//! one shared sequence counter, so every seal and open happens under the
//! session mutex; the session behaves as a single ordered stream.
//!
//! Failure policy: a decryption failure, short read, oversized frame,
//! unknown message type, or sequence exhaustion closes the session and
//! drops its binding from the database, leaving the routing table
//! intact. An unroutable probe is dropped with a log line and does not
//! affect the session.

use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::addr::OverlayAddr;
use crate::db::{AbsorbOutcome, Db, DbError};
use crate::identity::{IdentityError, IdentityService, NodeId};
use crate::probe::{self, DirectMap, ProbeError, Route};
use crate::protocol::{Destination, Message, ProtocolError, MAX_TABLE_ENTRIES};
use crate::record::{read_frame, write_frame, RecordCipher, RecordError, SessionSecret};

/// Errors that terminate a peer session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("peer {0} has no registered overlay address")]
    UnknownPeerAddress(NodeId),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Shared state every session task needs.
#[derive(Clone)]
pub struct SessionContext {
    /// The node database.
    pub db: Arc<RwLock<Db>>,
    /// Identity service handle.
    pub identity: Arc<dyn IdentityService>,
    /// Reverse probe transports.
    pub direct: Arc<DirectMap>,
    /// Interval between table pulls on each session.
    pub table_pull_interval: Duration,
    /// Upper bound on an encrypted frame read from a peer.
    pub max_frame_len: usize,
}

/// Transmit state: the write half of the transport plus cipher state.
struct SessionChannel {
    stream: TcpStream,
    cipher: RecordCipher,
}

impl SessionChannel {
    fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let ciphertext = self.cipher.seal(&message.encode()?)?;
        write_frame(&mut self.stream, &ciphertext)?;
        Ok(())
    }
}

/// An established, encrypted session with one peer.
pub struct PeerSession {
    peer: NodeId,
    peer_address: OverlayAddr,
    channel: Mutex<SessionChannel>,
}

impl PeerSession {
    /// The peer's channel-graph identity.
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    /// The peer's overlay address.
    pub fn peer_address(&self) -> OverlayAddr {
        self.peer_address
    }

    /// Encrypt and emit one message, advancing the shared counter.
    pub fn send(&self, message: &Message) -> Result<(), SessionError> {
        self.channel.lock().send(message)
    }

}

/// Bind a freshly handshaken transport into the database and service it
/// until it closes. Runs on the caller's thread; the periodic table pull
/// gets its own.
pub fn run_session(
    ctx: &SessionContext,
    stream: TcpStream,
    secret: SessionSecret,
    peer: NodeId,
) -> Result<(), SessionError> {
    let peer_address = ctx
        .db
        .read()
        .node_address(&peer)
        .ok_or(SessionError::UnknownPeerAddress(peer))?;

    let write_half = stream.try_clone().map_err(RecordError::Io)?;
    let shutdown_handle = stream.try_clone().map_err(RecordError::Io)?;
    let session = Arc::new(PeerSession {
        peer,
        peer_address,
        channel: Mutex::new(SessionChannel {
            stream: write_half,
            cipher: RecordCipher::new(&secret),
        }),
    });
    ctx.db
        .write()
        .set_peer_session(peer_address, session.clone())?;
    info!(peer = %peer_address, "peer session established");

    spawn_table_pull(session.clone(), ctx.table_pull_interval);

    let result = dispatch_loop(ctx, &session, stream);
    ctx.db.write().clear_peer_session(peer_address, &session);
    let _ = shutdown_handle.shutdown(Shutdown::Both);
    match &result {
        Ok(()) => info!(peer = %peer_address, "peer session closed"),
        Err(e) => warn!(peer = %peer_address, error = %e, "peer session failed"),
    }
    result
}

fn spawn_table_pull(session: Arc<PeerSession>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(e) = session.send(&Message::TableRequest { starting_block: 0 }) {
            debug!(peer = %session.peer_address(), error = %e, "table pull loop exiting");
            return;
        }
        debug!(peer = %session.peer_address(), "table request sent");
    });
}

fn dispatch_loop(
    ctx: &SessionContext,
    session: &Arc<PeerSession>,
    mut stream: TcpStream,
) -> Result<(), SessionError> {
    loop {
        let ciphertext = match read_frame(&mut stream, ctx.max_frame_len) {
            Ok(frame) => frame,
            Err(RecordError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };
        let message = {
            let mut channel = session.channel.lock();
            let plaintext = channel.cipher.open(&ciphertext)?;
            Message::decode(&plaintext)?
        };
        handle_message(ctx, session, message)?;
    }
}

fn handle_message(
    ctx: &SessionContext,
    session: &Arc<PeerSession>,
    message: Message,
) -> Result<(), SessionError> {
    match message {
        Message::TableRequest { starting_block } => {
            debug!(peer = %session.peer_address(), starting_block, "table request");
            let destinations: Vec<Destination> = {
                let db = ctx.db.read();
                let entries = db.entries_since(starting_block);
                if entries.len() > MAX_TABLE_ENTRIES {
                    warn!(
                        total = entries.len(),
                        sent = MAX_TABLE_ENTRIES,
                        "routing table exceeds one response, truncating"
                    );
                }
                entries
                    .into_iter()
                    .take(MAX_TABLE_ENTRIES)
                    .map(|entry| Destination {
                        address: entry.destination,
                        capacity: entry.capacity,
                    })
                    .collect()
            };
            session.send(&Message::TableResponse { destinations })
        }
        Message::TableResponse { destinations } => {
            let channels = ctx.identity.channels()?;
            let mut db = ctx.db.write();
            let mut installed = 0usize;
            let mut kept = 0usize;
            let mut skipped = 0usize;
            for destination in &destinations {
                match db.absorb_shared(destination, session.peer(), &channels)? {
                    AbsorbOutcome::Inserted | AbsorbOutcome::Replaced => installed += 1,
                    AbsorbOutcome::KeptExisting => kept += 1,
                    AbsorbOutcome::SkippedSelf
                    | AbsorbOutcome::SkippedUnknownDestination
                    | AbsorbOutcome::SkippedUnknownPeer => skipped += 1,
                }
            }
            debug!(
                peer = %session.peer_address(),
                count = destinations.len(),
                installed,
                kept,
                skipped,
                "table response absorbed"
            );
            Ok(())
        }
        Message::ForwardRoute(route) => handle_forward(ctx, route),
    }
}

/// Deliver a probe that reached its destination, or extend it by one hop
/// and pass it on.
fn handle_forward(ctx: &SessionContext, mut route: Route) -> Result<(), SessionError> {
    if ctx.db.read().local_address() == Some(route.destination) {
        debug!(token = %route.token, hops = route.hops.len(), "probe reached destination");
        if let Err(e) = ctx.direct.deliver(&route) {
            warn!(token = %route.token, error = %e, "reverse delivery failed");
        }
        return Ok(());
    }

    let channels = ctx.identity.channels()?;
    let next_session = {
        let db = ctx.db.read();
        match probe::append_local_hop(&db, &channels, &mut route) {
            Ok(next_hop) => match db.peer_session(next_hop) {
                Some(session) => session,
                None => {
                    warn!(next_hop = %next_hop, "no session to next hop, dropping probe");
                    return Ok(());
                }
            },
            Err(ProbeError::NoRoute(destination)) => {
                warn!(destination = %destination, "dropping unroutable probe");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    };
    debug!(
        destination = %route.destination,
        next_hop = %next_session.peer_address(),
        hops = route.hops.len(),
        "forwarding probe"
    );
    next_session.send(&Message::ForwardRoute(route))
}
