//! End-to-end route probing over a four-node chain.
//!
//! Topology: O - A - B - D, with sessions established over loopback TCP
//! through the full handshake. Routing tables are seeded so each node
//! already knows the next hop toward D, then O probes D and waits for
//! the probe on its reverse transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{node_overlay_addr, spawn_node, wait_until, TestGraph};
use lar::{Config, RoutingEntry};

#[test]
fn probe_traverses_chain_and_returns() {
    let mut graph = TestGraph::new(4);
    graph.add_channel(0, 1, 100, 10); // O - A
    graph.add_channel(1, 2, 50, 10); // A - B
    graph.add_channel(2, 3, 70, 10); // B - D
    let graph = Arc::new(graph);

    let mut config = Config::new();
    // Keep the periodic tasks out of the test window.
    config.sync.table_pull_interval_secs = 600;
    config.session.probe_timeout_secs = 30;

    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for index in 0..4 {
        let (node, dir) = spawn_node(&graph, index, config.clone());
        nodes.push(node);
        dirs.push(dir);
    }

    let destination = node_overlay_addr(3);
    // Seed each forwarding node with its next hop toward D.
    for (index, next_hop) in [(0, 1), (1, 2), (2, 3)] {
        let db = nodes[index].db();
        db.write()
            .put_routing_entry(RoutingEntry {
                destination,
                next_hop: node_overlay_addr(next_hop),
                capacity: 1_000,
                height: 0,
            })
            .unwrap();
    }

    // Bring up the session chain O->A, A->B, B->D.
    for index in 0..3 {
        nodes[index].connect_peer(&graph.dial_addr(index + 1)).unwrap();
    }
    for index in 0..3 {
        let db = nodes[index].db();
        let next = node_overlay_addr(index + 1);
        wait_until(Duration::from_secs(30), "session establishment", || {
            db.read().peer_session(next).is_some()
        });
    }

    let route = nodes[0].find_route(destination).unwrap();

    assert_eq!(route.destination, destination);
    assert_eq!(
        route.hops,
        vec![
            node_overlay_addr(1),
            node_overlay_addr(2),
            node_overlay_addr(3),
        ]
    );
    // min(bal(O->A), bal(A->B), bal(B->D)) = min(100, 50, 70)
    assert_eq!(route.capacity, 50);
}

#[test]
fn probe_to_unroutable_destination_fails_at_origin() {
    let mut graph = TestGraph::new(2);
    graph.add_channel(0, 1, 100, 100);
    let graph = Arc::new(graph);

    let mut config = Config::new();
    config.sync.table_pull_interval_secs = 600;
    config.session.probe_timeout_secs = 5;

    let (origin, _dir_o) = spawn_node(&graph, 0, config.clone());
    let (_peer, _dir_p) = spawn_node(&graph, 1, config);

    // No routing entry toward the destination: the probe cannot leave
    // the origin.
    let err = origin.find_route(node_overlay_addr(1)).unwrap_err();
    assert!(err.to_string().contains("no routing entry"));
}
