//! Radix address tree.
//!
//! Binary trie keyed on the 32-bit address path, one bit per level, fixed
//! depth 32. Every registered address occupies a leaf; interior nodes are
//! pure routing aids. The tree also answers the closest-free-address query
//! used to validate registrations: descending along a seed address, the
//! seed-side subtree is tried first at every level, and when it is full
//! the sibling subtree is searched depth-first preferring the seed-side
//! direction, so the result is the nearest unoccupied address.
//!
//! Nodes live in an arena indexed by `u32`; leaves carry an [`EntryId`]
//! pointing into the database's address-entry arena.

use thiserror::Error;

use crate::addr::{OverlayAddr, ADDR_BITS};

/// Errors from address tree operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("address {0} is already registered")]
    Duplicate(OverlayAddr),

    #[error("no free address near {0}")]
    Exhausted(OverlayAddr),
}

/// Index of a registered address entry in the database arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl EntryId {
    /// Create an id from an arena index.
    pub fn new(index: usize) -> Self {
        Self(index as u32)
    }

    /// The arena index.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

const ROOT: usize = 0;

#[derive(Clone, Default)]
struct TrieNode {
    children: [Option<u32>; 2],
    entry: Option<EntryId>,
}

/// Bit-indexed trie over all registered overlay addresses.
pub struct AddressTree {
    nodes: Vec<TrieNode>,
    len: usize,
}

impl Default for AddressTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            len: 0,
        }
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the tree holds no addresses.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn child(&self, node: usize, bit: bool) -> Option<usize> {
        self.nodes[node].children[bit as usize].map(|i| i as usize)
    }

    fn leaf(&self, addr: OverlayAddr) -> Option<usize> {
        let mut node = ROOT;
        for depth in 0..ADDR_BITS {
            node = self.child(node, addr.bit(depth))?;
        }
        Some(node)
    }

    /// Whether `addr` is registered.
    pub fn contains(&self, addr: OverlayAddr) -> bool {
        self.leaf(addr).is_some()
    }

    /// Look up the entry id registered at `addr`.
    pub fn lookup(&self, addr: OverlayAddr) -> Option<EntryId> {
        self.leaf(addr).and_then(|node| self.nodes[node].entry)
    }

    /// Register `addr`, creating missing interior nodes along its path.
    pub fn insert(&mut self, addr: OverlayAddr, id: EntryId) -> Result<(), TreeError> {
        let mut node = ROOT;
        for depth in 0..ADDR_BITS {
            let bit = addr.bit(depth) as usize;
            node = match self.nodes[node].children[bit] {
                Some(child) => child as usize,
                None => {
                    let child = self.nodes.len() as u32;
                    self.nodes.push(TrieNode::default());
                    self.nodes[node].children[bit] = Some(child);
                    child as usize
                }
            };
        }
        if self.nodes[node].entry.is_some() {
            return Err(TreeError::Duplicate(addr));
        }
        self.nodes[node].entry = Some(id);
        self.len += 1;
        Ok(())
    }

    /// Return the closest unoccupied address to `seed`.
    ///
    /// The seed-side subtree is preferred at every level; when it is full,
    /// the sibling subtree's candidate nearest the seed is taken. A missing
    /// seed-side edge means the seed itself is free and is returned as its
    /// own closest address.
    pub fn suggest(&self, seed: OverlayAddr) -> Result<OverlayAddr, TreeError> {
        let bits = seed.to_bits();
        let mut out = bits;
        if self.descend(ROOT, 0, &bits, &mut out) {
            Ok(OverlayAddr::from_bits(&out))
        } else {
            Err(TreeError::Exhausted(seed))
        }
    }

    fn descend(
        &self,
        node: usize,
        depth: usize,
        seed: &[bool; ADDR_BITS],
        out: &mut [bool; ADDR_BITS],
    ) -> bool {
        if depth == ADDR_BITS {
            // Occupied leaf.
            return false;
        }
        let bit = seed[depth];
        match self.child(node, bit) {
            None => {
                // The seed's own subtree is untouched: the seed is free.
                out[depth..].copy_from_slice(&seed[depth..]);
                true
            }
            Some(seed_side) => {
                if self.descend(seed_side, depth + 1, seed, out) {
                    return true;
                }
                out[depth] = !bit;
                match self.child(node, !bit) {
                    None => {
                        for slot in &mut out[depth + 1..] {
                            *slot = bit;
                        }
                        true
                    }
                    Some(sibling) => self.closest_free(sibling, depth + 1, bit, out),
                }
            }
        }
    }

    /// Depth-first search for a free address inside a sibling subtree,
    /// preferring the `toward` direction (the side the seed lies on) at
    /// every level. Succeeds only at a missing edge, whose whole subtree
    /// is free; the remaining bits are padded toward the seed.
    fn closest_free(
        &self,
        node: usize,
        depth: usize,
        toward: bool,
        out: &mut [bool; ADDR_BITS],
    ) -> bool {
        if depth == ADDR_BITS {
            return false;
        }
        for bit in [toward, !toward] {
            out[depth] = bit;
            match self.child(node, bit) {
                None => {
                    for slot in &mut out[depth + 1..] {
                        *slot = toward;
                    }
                    return true;
                }
                Some(child) => {
                    if self.closest_free(child, depth + 1, toward, out) {
                        return true;
                    }
                }
            }
        }
        false
    }
}
