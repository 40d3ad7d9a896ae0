//! The node database.
//!
//! One logical object owning the address tree, the address entries it
//! indexes, the routing table, and the routing history. Callers guard it
//! with a single `RwLock`; nothing in here blocks or performs service
//! calls, so the lock is only ever held across memory operations and the
//! append/rewrite of the two database files.
//!
//! Ownership: the entry arena owns every [`AddressEntry`]; the tree and
//! the node index map into it by [`EntryId`]. Each entry optionally
//! points at its live routing entry (a [`RouteSlot`] into the history
//! arena) and at the peer session for its address.

mod persist;
mod verify;

pub use verify::RegistrationError;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::addr::OverlayAddr;
use crate::history::{RouteSlot, RoutingEntry, RoutingHistory};
use crate::identity::{Channel, NodeId};
use crate::peer::PeerSession;
use crate::protocol::Destination;
use crate::tree::{AddressTree, EntryId, TreeError};
use crate::wire::WireError;

/// Errors from database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("address {0} is not registered")]
    NotRegistered(OverlayAddr),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt database record: {0}")]
    Corrupt(#[from] WireError),
}

/// An accepted on-chain address registration. Immutable once accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrationRecord {
    /// The registered overlay address.
    pub address: OverlayAddr,
    /// Identity that signed the registration.
    pub node_id: NodeId,
    /// Height of the block carrying the registration.
    pub height: u64,
    /// Id of the registering transaction.
    pub txid: [u8; 32],
    /// Protocol version declared at registration.
    pub version: u32,
}

/// A registered address and everything attached to it. Entries are never
/// destroyed at runtime; addresses are permanent in this protocol.
pub struct AddressEntry {
    /// The registration that created this entry.
    pub record: RegistrationRecord,
    routing: Option<RouteSlot>,
    session: Option<Arc<PeerSession>>,
}

/// Outcome of folding a peer-shared destination into the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbsorbOutcome {
    /// No entry existed; the shared one was installed.
    Inserted,
    /// The shared entry matched or improved the stored capacity.
    Replaced,
    /// The shared entry would worsen the stored capacity.
    KeptExisting,
    /// The share was about our own address.
    SkippedSelf,
    /// The shared destination is not a registered address.
    SkippedUnknownDestination,
    /// The sharing peer has no registered address.
    SkippedUnknownPeer,
}

/// The node database.
pub struct Db {
    data_dir: PathBuf,
    height: u64,
    tree: AddressTree,
    entries: Vec<AddressEntry>,
    node_index: HashMap<NodeId, EntryId>,
    history: RoutingHistory,
    local_address: Option<OverlayAddr>,
}

impl Db {
    /// Create an empty database rooted at `data_dir`. Nothing is read or
    /// written until records are accepted; use [`Db::open`] to restore
    /// persisted state.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            height: 0,
            tree: AddressTree::new(),
            entries: Vec::new(),
            node_index: HashMap::new(),
            history: RoutingHistory::new(),
            local_address: None,
        }
    }

    /// Height of the last synced block.
    pub fn height(&self) -> u64 {
        self.height
    }

    /// Number of registered addresses.
    pub fn registered_count(&self) -> usize {
        self.tree.len()
    }

    /// This node's own overlay address, once registered.
    pub fn local_address(&self) -> Option<OverlayAddr> {
        self.local_address
    }

    /// Record this node's own overlay address.
    pub fn set_local_address(&mut self, address: OverlayAddr) {
        self.local_address = Some(address);
    }

    fn entry(&self, id: EntryId) -> &AddressEntry {
        &self.entries[id.index()]
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut AddressEntry {
        &mut self.entries[id.index()]
    }

    /// Whether `address` is registered.
    pub fn is_address_registered(&self, address: OverlayAddr) -> bool {
        self.tree.contains(address)
    }

    /// Whether `node` has registered an address.
    pub fn is_node_registered(&self, node: &NodeId) -> bool {
        self.node_index.contains_key(node)
    }

    /// The overlay address registered by `node`.
    pub fn node_address(&self, node: &NodeId) -> Option<OverlayAddr> {
        self.node_index.get(node).map(|id| self.entry(*id).record.address)
    }

    /// The identity that registered `address`.
    pub fn address_node(&self, address: OverlayAddr) -> Option<NodeId> {
        self.tree
            .lookup(address)
            .map(|id| self.entry(id).record.node_id)
    }

    /// The registration record for `address`.
    pub fn registration(&self, address: OverlayAddr) -> Option<&RegistrationRecord> {
        self.tree.lookup(address).map(|id| &self.entry(id).record)
    }

    /// The closest unoccupied address to `seed`.
    pub fn suggest(&self, seed: OverlayAddr) -> Result<OverlayAddr, TreeError> {
        self.tree.suggest(seed)
    }

    /// Install a registration record in memory.
    pub fn insert_record(&mut self, record: RegistrationRecord) -> Result<EntryId, DbError> {
        let id = EntryId::new(self.entries.len());
        self.tree.insert(record.address, id)?;
        self.node_index.insert(record.node_id, id);
        info!(address = %record.address, node = %record.node_id.short(), "address registered");
        self.entries.push(AddressEntry {
            record,
            routing: None,
            session: None,
        });
        Ok(id)
    }

    /// Install a verified registration and append it to the address log.
    pub fn accept_registration(&mut self, record: RegistrationRecord) -> Result<(), DbError> {
        self.insert_record(record.clone())?;
        self.append_record_to_log(&record)
    }

    /// The live routing entry for `destination`.
    pub fn routing_entry(&self, destination: OverlayAddr) -> Option<&RoutingEntry> {
        let id = self.tree.lookup(destination)?;
        self.entry(id).routing.map(|slot| self.history.get(slot))
    }

    /// Install a routing entry, replacing any previous entry for its
    /// destination and moving it to the front of the history.
    pub fn put_routing_entry(&mut self, entry: RoutingEntry) -> Result<(), DbError> {
        let id = self
            .tree
            .lookup(entry.destination)
            .ok_or(DbError::NotRegistered(entry.destination))?;
        if let Some(slot) = self.entry_mut(id).routing.take() {
            self.history.remove(slot);
        }
        debug!(
            destination = %entry.destination,
            next_hop = %entry.next_hop,
            capacity = entry.capacity,
            height = entry.height,
            "routing entry installed"
        );
        let slot = self.history.push_front(entry);
        self.entry_mut(id).routing = Some(slot);
        Ok(())
    }

    /// Every routing entry updated at or after `height`, newest first.
    pub fn entries_since(&self, height: u64) -> Vec<RoutingEntry> {
        self.history.since(height)
    }

    /// The whole routing table, newest first.
    pub fn routing_entries(&self) -> Vec<RoutingEntry> {
        self.history.since(0)
    }

    /// Fold a destination shared by `peer` into the routing table.
    ///
    /// The stored capacity is `min(offered, local balance to the peer)`
    /// and an existing entry is replaced only when the new capacity
    /// matches or improves it, so the table is capacity-monotonic under
    /// exchange.
    pub fn absorb_shared(
        &mut self,
        shared: &Destination,
        peer: &NodeId,
        channels: &[Channel],
    ) -> Result<AbsorbOutcome, DbError> {
        if self.local_address == Some(shared.address) {
            return Ok(AbsorbOutcome::SkippedSelf);
        }
        let Some(next_hop) = self.node_address(peer) else {
            return Ok(AbsorbOutcome::SkippedUnknownPeer);
        };
        if !self.tree.contains(shared.address) {
            debug!(destination = %shared.address, "ignoring share for unregistered destination");
            return Ok(AbsorbOutcome::SkippedUnknownDestination);
        }

        let mut capacity = shared.capacity;
        for channel in channels.iter().filter(|c| c.remote == *peer) {
            capacity = capacity.min(channel.local_balance);
        }

        let entry = RoutingEntry {
            destination: shared.address,
            next_hop,
            capacity,
            height: self.height,
        };

        match self.routing_entry(shared.address).map(|e| e.capacity) {
            None => {
                self.put_routing_entry(entry)?;
                Ok(AbsorbOutcome::Inserted)
            }
            Some(stored) if capacity >= stored => {
                self.put_routing_entry(entry)?;
                Ok(AbsorbOutcome::Replaced)
            }
            Some(stored) => {
                debug!(
                    destination = %shared.address,
                    offered = capacity,
                    stored,
                    "keeping better routing entry"
                );
                Ok(AbsorbOutcome::KeptExisting)
            }
        }
    }

    /// Re-apply local channel balances to the routing table.
    ///
    /// Every entry whose next hop is a channel counterparty is clamped to
    /// that channel's local balance (in place, keeping its history
    /// position), and each registered neighbor is re-shared as a direct
    /// destination.
    pub fn refresh_from_balances(&mut self, channels: &[Channel]) -> Result<(), DbError> {
        for channel in channels {
            let Some(neighbor) = self.node_address(&channel.remote) else {
                continue;
            };

            let mut clamped = 0usize;
            self.history.for_each_mut(|entry| {
                if entry.next_hop == neighbor && entry.capacity > channel.local_balance {
                    entry.capacity = channel.local_balance;
                    clamped += 1;
                }
            });
            if clamped > 0 {
                debug!(
                    %neighbor,
                    balance = channel.local_balance,
                    entries = clamped,
                    "clamped routing capacities to channel balance"
                );
            }

            let direct = Destination {
                address: neighbor,
                capacity: channel.local_balance,
            };
            self.absorb_shared(&direct, &channel.remote, channels)?;
        }
        Ok(())
    }

    /// The live session with the peer registered at `address`.
    pub fn peer_session(&self, address: OverlayAddr) -> Option<Arc<PeerSession>> {
        let id = self.tree.lookup(address)?;
        self.entry(id).session.clone()
    }

    /// Bind a session to the peer registered at `address`, replacing any
    /// previous one.
    pub fn set_peer_session(
        &mut self,
        address: OverlayAddr,
        session: Arc<PeerSession>,
    ) -> Result<(), DbError> {
        let id = self
            .tree
            .lookup(address)
            .ok_or(DbError::NotRegistered(address))?;
        self.entry_mut(id).session = Some(session);
        Ok(())
    }

    /// Drop the session binding for `address`, but only if it still is
    /// `session`; a reconnect may already have replaced it.
    pub fn clear_peer_session(&mut self, address: OverlayAddr, session: &Arc<PeerSession>) {
        if let Some(id) = self.tree.lookup(address) {
            let bound = &mut self.entry_mut(id).session;
            if bound.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
                *bound = None;
            }
        }
    }

    /// Addresses with a live peer session.
    pub fn sessions(&self) -> Vec<(OverlayAddr, NodeId)> {
        self.entries
            .iter()
            .filter(|entry| entry.session.is_some())
            .map(|entry| (entry.record.address, entry.record.node_id))
            .collect()
    }
}
