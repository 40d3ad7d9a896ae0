//! Shared fixtures for multi-node tests: a static channel graph serving
//! both external service traits, and node spawning over loopback TCP.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tempfile::TempDir;

use lar::{
    Block, ChainError, ChainService, Channel, Config, IdentityError, IdentityService, Node,
    NodeId, OverlayAddr, RegistrationRecord, SIGNATURE_SIZE,
};

pub fn overlay_addr(last: u8) -> OverlayAddr {
    OverlayAddr::from_bytes([10, 0, 0, last])
}

pub fn node_id(index: usize) -> NodeId {
    let mut bytes = [0u8; 33];
    bytes[0] = 2;
    bytes[1] = index as u8;
    NodeId::from_bytes(bytes)
}

/// The overlay address node `index` registered in every test database.
pub fn node_overlay_addr(index: usize) -> OverlayAddr {
    overlay_addr(index as u8 + 1)
}

/// Channel graph with per-direction balances, plus the dial address of
/// every running node.
pub struct TestGraph {
    node_count: usize,
    balances: HashMap<(usize, usize), i64>,
    dial_addrs: RwLock<HashMap<usize, String>>,
}

impl TestGraph {
    pub fn new(node_count: usize) -> Self {
        Self {
            node_count,
            balances: HashMap::new(),
            dial_addrs: RwLock::new(HashMap::new()),
        }
    }

    /// Open a channel between `a` and `b` with the given local balances.
    pub fn add_channel(&mut self, a: usize, b: usize, balance_a: i64, balance_b: i64) {
        self.balances.insert((a, b), balance_a);
        self.balances.insert((b, a), balance_b);
    }

    pub fn set_dial_addr(&self, index: usize, addr: String) {
        self.dial_addrs.write().insert(index, addr);
    }

    pub fn dial_addr(&self, index: usize) -> String {
        self.dial_addrs.read()[&index].clone()
    }

    fn neighbors(&self, index: usize) -> Vec<usize> {
        let mut neighbors: Vec<usize> = self
            .balances
            .keys()
            .filter(|(a, _)| *a == index)
            .map(|(_, b)| *b)
            .collect();
        neighbors.sort_unstable();
        neighbors
    }

    fn index_of(&self, node: &NodeId) -> Option<usize> {
        (0..self.node_count).find(|i| node_id(*i) == *node)
    }
}

/// Identity service view of the graph from one node. Signatures carry
/// the signer index in their first byte; zero is invalid.
pub struct GraphIdentity {
    pub graph: Arc<TestGraph>,
    pub local: usize,
}

impl IdentityService for GraphIdentity {
    fn local_node(&self) -> Result<NodeId, IdentityError> {
        Ok(node_id(self.local))
    }

    fn channels(&self) -> Result<Vec<Channel>, IdentityError> {
        Ok(self
            .graph
            .neighbors(self.local)
            .into_iter()
            .map(|peer| Channel {
                remote: node_id(peer),
                local_balance: self.graph.balances[&(self.local, peer)],
            })
            .collect())
    }

    fn node_neighbors(&self, node: &NodeId) -> Result<Vec<NodeId>, IdentityError> {
        Ok(self
            .graph
            .index_of(node)
            .map(|index| self.graph.neighbors(index).into_iter().map(node_id).collect())
            .unwrap_or_default())
    }

    fn sign(&self, _message: &[u8]) -> Result<[u8; SIGNATURE_SIZE], IdentityError> {
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature[0] = self.local as u8 + 1;
        Ok(signature)
    }

    fn verify(
        &self,
        _message: &[u8],
        signature: &[u8; SIGNATURE_SIZE],
    ) -> Result<Option<NodeId>, IdentityError> {
        match signature[0] as usize {
            0 => Ok(None),
            marker if marker <= self.graph.node_count => Ok(Some(node_id(marker - 1))),
            _ => Ok(None),
        }
    }

    fn network_addresses(&self, node: &NodeId) -> Result<Vec<String>, IdentityError> {
        Ok(self
            .graph
            .index_of(node)
            .and_then(|index| self.graph.dial_addrs.read().get(&index).cloned())
            .map(|addr| vec![addr])
            .unwrap_or_default())
    }
}

/// A chain with no blocks; tests install registrations directly.
pub struct EmptyChain;

impl ChainService for EmptyChain {
    fn block_count(&self) -> Result<u64, ChainError> {
        Ok(0)
    }

    fn block_hash(&self, height: u64) -> Result<String, ChainError> {
        Err(ChainError::Service(format!("no block at height {height}")))
    }

    fn block(&self, hash: &str) -> Result<Block, ChainError> {
        Err(ChainError::Service(format!("no block {hash}")))
    }
}

/// Bring up node `index`: every graph member pre-registered, the local
/// address resolved, and a listener bound on an ephemeral loopback port
/// whose address is published in the graph.
pub fn spawn_node(graph: &Arc<TestGraph>, index: usize, mut config: Config) -> (Node, TempDir) {
    let dir = TempDir::new().unwrap();
    config.data_dir = Some(dir.path().to_path_buf());

    let identity = Arc::new(GraphIdentity {
        graph: graph.clone(),
        local: index,
    });
    let mut node = Node::new(config, Arc::new(EmptyChain), identity).unwrap();

    {
        let db = node.db();
        let mut db = db.write();
        for i in 0..graph.node_count {
            db.insert_record(RegistrationRecord {
                address: node_overlay_addr(i),
                node_id: node_id(i),
                height: 0,
                txid: [i as u8; 32],
                version: 0,
            })
            .unwrap();
        }
        db.set_local_address(node_overlay_addr(index));
    }

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    graph.set_dial_addr(index, listener.local_addr().unwrap().to_string());
    node.listen_on(listener).unwrap();
    (node, dir)
}

/// Poll until `condition` holds, failing the test after `timeout`.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, what: &str, condition: F) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(50));
    }
}
