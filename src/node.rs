//! Daemon assembly.
//!
//! The [`Node`] ties the pieces together: it restores the database,
//! serves inbound peer and destination connections, keeps the address
//! tree synced to the chain, refreshes routing capacities from local
//! channel balances, and drives the origin side of route probing.
//!
//! Long-lived tasks: one acceptor on the listening port, a read-dispatch
//! and a table-pull task per session (see `peer`), a chain synchronizer,
//! and a balance refresher. Shutdown flushes the routing snapshot.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::addr::OverlayAddr;
use crate::chain::{scan_registrations, ChainError, ChainService};
use crate::config::Config;
use crate::db::{Db, DbError, RegistrationError};
use crate::handshake::{self, HandshakeError};
use crate::identity::{IdentityError, IdentityService, NodeId};
use crate::peer::{run_session, SessionContext, SessionError};
use crate::probe::{append_local_hop, DirectMap, ProbeError, Route, RouteToken, TOKEN_SIZE};
use crate::protocol::{Message, CONN_TYPE_DESTINATION, CONN_TYPE_PEER};

/// Errors from node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("destination {0} is not a registered address")]
    NotRegistered(OverlayAddr),

    #[error("no session established with {0}")]
    NoSession(OverlayAddr),

    #[error("could not reach {node} at any advertised address")]
    Unreachable { node: NodeId },

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A running overlay routing node.
pub struct Node {
    config: Config,
    db: Arc<RwLock<Db>>,
    chain: Arc<dyn ChainService>,
    identity: Arc<dyn IdentityService>,
    direct: Arc<DirectMap>,
    shutdown: Arc<AtomicBool>,
    listen_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Node {
    /// Restore the database and assemble a node from its external
    /// services.
    pub fn new(
        config: Config,
        chain: Arc<dyn ChainService>,
        identity: Arc<dyn IdentityService>,
    ) -> Result<Self, NodeError> {
        let db = Db::open(config.data_dir())?;
        Ok(Self {
            config,
            db: Arc::new(RwLock::new(db)),
            chain,
            identity,
            direct: Arc::new(DirectMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            listen_addr: None,
            threads: Vec::new(),
        })
    }

    /// The node database.
    pub fn db(&self) -> Arc<RwLock<Db>> {
        self.db.clone()
    }

    /// The bound listening address, once listening.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            db: self.db.clone(),
            identity: self.identity.clone(),
            direct: self.direct.clone(),
            table_pull_interval: Duration::from_secs(self.config.sync.table_pull_interval_secs),
            max_frame_len: self.config.session.max_frame_len,
        }
    }

    /// Bring the node fully up: initial chain sync, local address
    /// resolution, listener, neighbor auto-connect, and background
    /// synchronizers.
    pub fn start(&mut self) -> Result<(), NodeError> {
        self.sync_registrations()?;
        self.resolve_local_address()?;
        let listener = TcpListener::bind(("0.0.0.0", self.config.port()))?;
        self.listen_on(listener)?;
        self.connect_registered_neighbors();
        self.spawn_chain_sync();
        self.spawn_balance_refresh();
        Ok(())
    }

    /// Scan the chain for new registrations and fold the valid ones into
    /// the tree.
    pub fn sync_registrations(&self) -> Result<(), NodeError> {
        sync_chain(&self.db, self.chain.as_ref(), self.identity.as_ref())
    }

    /// Look up this node's own overlay address.
    pub fn resolve_local_address(&self) -> Result<(), NodeError> {
        let local_node = self.identity.local_node()?;
        let mut db = self.db.write();
        match db.node_address(&local_node) {
            Some(address) => {
                db.set_local_address(address);
                info!(%address, "local overlay address");
            }
            None => warn!("local node has no registered overlay address yet"),
        }
        Ok(())
    }

    /// Serve peer and destination connections on an already-bound
    /// listener.
    pub fn listen_on(&mut self, listener: TcpListener) -> Result<(), NodeError> {
        let addr = listener.local_addr()?;
        self.listen_addr = Some(addr);
        info!(%addr, "listening for connections");

        let ctx = self.session_context();
        let shutdown = self.shutdown.clone();
        self.threads
            .push(thread::spawn(move || accept_loop(listener, ctx, shutdown)));
        Ok(())
    }

    /// Dial a peer, run the initiator handshake, and service the session
    /// on a background thread.
    pub fn connect_peer(&self, addr: &str) -> Result<(), NodeError> {
        let mut stream = TcpStream::connect(addr)?;
        stream.write_all(&[CONN_TYPE_PEER])?;
        let (secret, peer) = handshake::initiate(&mut stream, self.identity.as_ref(), &self.db)?;
        info!(addr, peer = %peer.short(), "connected to peer");

        let ctx = self.session_context();
        thread::spawn(move || {
            if let Err(e) = run_session(&ctx, stream, secret, peer) {
                debug!(error = %e, "outbound session ended");
            }
        });
        Ok(())
    }

    /// Try to establish a session with every registered channel
    /// neighbor, using its advertised network addresses in order.
    pub fn connect_registered_neighbors(&self) {
        let channels = match self.identity.channels() {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "cannot list channels for auto-connect");
                return;
            }
        };
        for channel in channels {
            let neighbor_addr = {
                let db = self.db.read();
                db.node_address(&channel.remote)
            };
            let Some(neighbor_addr) = neighbor_addr else {
                continue;
            };
            if self.db.read().peer_session(neighbor_addr).is_some() {
                continue;
            }
            let addrs = match self.identity.network_addresses(&channel.remote) {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!(node = %channel.remote.short(), error = %e, "cannot resolve addresses");
                    continue;
                }
            };
            let connected = addrs.iter().any(|addr| match self.connect_peer(addr) {
                Ok(()) => true,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "dial failed");
                    false
                }
            });
            if !connected {
                warn!(node = %channel.remote.short(), "could not reach neighbor");
            }
        }
    }

    /// Probe a capacity-constrained route to `destination`, resolving
    /// the reverse transport through the identity service.
    pub fn find_route(&self, destination: OverlayAddr) -> Result<Route, NodeError> {
        let dest_node = self
            .db
            .read()
            .address_node(destination)
            .ok_or(NodeError::NotRegistered(destination))?;
        let addrs = self.identity.network_addresses(&dest_node)?;
        let stream = addrs
            .iter()
            .find_map(|addr| match TcpStream::connect(addr) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "destination dial failed");
                    None
                }
            })
            .ok_or(NodeError::Unreachable { node: dest_node })?;
        self.find_route_via(destination, stream)
    }

    /// Probe with an explicitly dialed reverse transport.
    pub fn find_route_at(&self, destination: OverlayAddr, addr: &str) -> Result<Route, NodeError> {
        if !self.db.read().is_address_registered(destination) {
            return Err(NodeError::NotRegistered(destination));
        }
        self.find_route_via(destination, TcpStream::connect(addr)?)
    }

    fn find_route_via(
        &self,
        destination: OverlayAddr,
        mut stream: TcpStream,
    ) -> Result<Route, NodeError> {
        let mut route = Route::new(destination);
        stream.write_all(&[CONN_TYPE_DESTINATION])?;
        stream.write_all(route.token.as_bytes())?;
        self.direct.insert(route.token, stream);

        let forwarded = self.forward_from_origin(&mut route);
        if let Err(e) = forwarded {
            self.direct.discard(&route.token);
            return Err(e);
        }

        debug!(%destination, token = %route.token, "probe sent, awaiting reply");
        let reply = self
            .direct
            .receive(&route.token, self.config.session.probe_timeout())?;
        Ok(reply)
    }

    fn forward_from_origin(&self, route: &mut Route) -> Result<(), NodeError> {
        let channels = self.identity.channels()?;
        let first_hop_session = {
            let db = self.db.read();
            let next_hop = append_local_hop(&db, &channels, route)?;
            db.peer_session(next_hop)
                .ok_or(NodeError::NoSession(next_hop))?
        };
        first_hop_session.send(&Message::ForwardRoute(route.clone()))?;
        Ok(())
    }

    /// Suggested registration addresses seeded from each registered
    /// channel neighbor.
    pub fn registration_suggestions(
        &self,
    ) -> Result<Vec<(OverlayAddr, OverlayAddr)>, NodeError> {
        let channels = self.identity.channels()?;
        let db = self.db.read();
        let mut suggestions = Vec::new();
        for channel in &channels {
            if let Some(neighbor) = db.node_address(&channel.remote) {
                if let Ok(suggested) = db.suggest(neighbor) {
                    suggestions.push((neighbor, suggested));
                }
            }
        }
        Ok(suggestions)
    }

    fn spawn_chain_sync(&mut self) {
        let interval = Duration::from_secs(self.config.sync.chain_interval_secs);
        let db = self.db.clone();
        let chain = self.chain.clone();
        let identity = self.identity.clone();
        let shutdown = self.shutdown.clone();
        self.threads.push(thread::spawn(move || {
            while !sleep_until_shutdown(&shutdown, interval) {
                match sync_chain(&db, chain.as_ref(), identity.as_ref()) {
                    Ok(()) => {}
                    Err(NodeError::Db(e @ DbError::Io { .. })) => {
                        error!(error = %e, "database write failed, aborting");
                        std::process::exit(1);
                    }
                    Err(e) => warn!(error = %e, "chain sync failed"),
                }
            }
        }));
    }

    fn spawn_balance_refresh(&mut self) {
        let interval = Duration::from_secs(self.config.sync.balance_interval_secs);
        let db = self.db.clone();
        let identity = self.identity.clone();
        let shutdown = self.shutdown.clone();
        self.threads.push(thread::spawn(move || loop {
            match identity.channels() {
                Ok(channels) => {
                    if let Err(e) = db.write().refresh_from_balances(&channels) {
                        warn!(error = %e, "balance refresh failed");
                    }
                }
                Err(e) => warn!(error = %e, "cannot list channels for refresh"),
            }
            if sleep_until_shutdown(&shutdown, interval) {
                return;
            }
        }));
    }

    /// Stop background tasks and flush the routing snapshot.
    pub fn shutdown(&mut self) -> Result<(), NodeError> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("shutting down");
        if let Some(addr) = self.listen_addr {
            // Nudge the acceptor out of its blocking accept.
            let _ = TcpStream::connect(("127.0.0.1", addr.port()));
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.db.read().save_routing_snapshot()?;
        Ok(())
    }
}

/// One chain scan pass: fetch new blocks, verify their registrations,
/// install the valid ones, and advance the synced height.
fn sync_chain(
    db: &RwLock<Db>,
    chain: &dyn ChainService,
    identity: &dyn IdentityService,
) -> Result<(), NodeError> {
    let tip = chain.block_count()?;
    let from = db.read().height() + 1;
    if tip < from {
        return Ok(());
    }
    info!(from, to = tip, "scanning chain for registrations");
    let registrations = scan_registrations(chain, from, tip)?;

    let mut accepted = 0usize;
    let mut db = db.write();
    for registration in &registrations {
        match db.verify_registration(registration, identity) {
            Ok(record) => {
                db.accept_registration(record)?;
                accepted += 1;
            }
            Err(RegistrationError::Identity(e)) => return Err(e.into()),
            Err(e) => info!(address = %registration.address, reason = %e, "rejected registration"),
        }
    }
    db.advance_height(tip)?;
    if !registrations.is_empty() {
        info!(found = registrations.len(), accepted, "chain scan complete");
    }
    Ok(())
}

fn accept_loop(listener: TcpListener, ctx: SessionContext, shutdown: Arc<AtomicBool>) {
    for conn in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();
        thread::spawn(move || {
            if let Err(e) = serve_connection(ctx, stream) {
                if matches!(&e, NodeError::Handshake(h) if h.is_fatal()) {
                    error!(error = %e, "cryptographic self-inconsistency, aborting");
                    std::process::exit(1);
                }
                debug!(error = %e, "inbound connection ended");
            }
        });
    }
}

fn serve_connection(ctx: SessionContext, mut stream: TcpStream) -> Result<(), NodeError> {
    let remote = stream.peer_addr()?;
    let mut conn_type = [0u8; 1];
    stream.read_exact(&mut conn_type)?;
    match conn_type[0] {
        CONN_TYPE_PEER => {
            debug!(%remote, "inbound peer connection");
            let (secret, peer) = handshake::accept(&mut stream, ctx.identity.as_ref(), &ctx.db)?;
            run_session(&ctx, stream, secret, peer)?;
            Ok(())
        }
        CONN_TYPE_DESTINATION => {
            let mut token = [0u8; TOKEN_SIZE];
            stream.read_exact(&mut token)?;
            let token = RouteToken::from_bytes(token);
            debug!(%remote, %token, "reverse probe transport registered");
            ctx.direct.insert(token, stream);
            Ok(())
        }
        other => {
            warn!(%remote, conn_type = other, "unknown connection type");
            Ok(())
        }
    }
}

/// Sleep in short slices so shutdown is observed promptly. Returns true
/// once shutdown has been requested.
fn sleep_until_shutdown(shutdown: &AtomicBool, duration: Duration) -> bool {
    let slice = Duration::from_millis(200);
    let mut remaining = duration;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
    shutdown.load(Ordering::SeqCst)
}
