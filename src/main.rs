//! lard: the overlay routing daemon.
//!
//! Loads configuration, connects the chain and identity bridges, brings
//! the node up, and then serves a small line-oriented console until
//! `quit`, which flushes the routing snapshot and exits.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

use lar::config::Config;
use lar::node::Node;
use lar::rpc::{RpcChainService, RpcIdentityService};
use lar::OverlayAddr;

/// Overlay routing daemon for payment channel networks
#[derive(Parser, Debug)]
#[command(name = "lard", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listening port for peer and destination connections
    #[arg(long)]
    port: Option<u16>,

    /// Data directory holding address.db and routing.db
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Chain service bridge endpoint (host:port)
    #[arg(long, value_name = "ADDR")]
    chain_endpoint: Option<String>,

    /// Identity service bridge endpoint (host:port)
    #[arg(long, value_name = "ADDR")]
    identity_endpoint: Option<String>,
}

fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let mut config = if let Some(path) = &args.config {
        match Config::load_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load configuration: {e}");
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok((config, loaded)) => {
                for path in &loaded {
                    info!(path = %path.display(), "loaded config file");
                }
                config
            }
            Err(e) => {
                error!("failed to load configuration: {e}");
                std::process::exit(1);
            }
        }
    };

    if args.port.is_some() {
        config.listen_port = args.port;
    }
    if args.data_dir.is_some() {
        config.data_dir = args.data_dir.clone();
    }
    if args.chain_endpoint.is_some() {
        config.chain.endpoint = args.chain_endpoint.clone();
    }
    if args.identity_endpoint.is_some() {
        config.identity.endpoint = args.identity_endpoint.clone();
    }

    let Some(chain_endpoint) = config.chain.endpoint.clone() else {
        error!("no chain endpoint configured (chain.endpoint / --chain-endpoint)");
        std::process::exit(1);
    };
    let Some(identity_endpoint) = config.identity.endpoint.clone() else {
        error!("no identity endpoint configured (identity.endpoint / --identity-endpoint)");
        std::process::exit(1);
    };

    info!(endpoint = %chain_endpoint, "connecting to chain service");
    let chain = match RpcChainService::connect(&chain_endpoint) {
        Ok(chain) => Arc::new(chain),
        Err(e) => {
            error!("cannot reach chain service: {e}");
            std::process::exit(1);
        }
    };

    info!(endpoint = %identity_endpoint, "connecting to identity service");
    let identity = match RpcIdentityService::connect(&identity_endpoint) {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!("cannot reach identity service: {e}");
            std::process::exit(1);
        }
    };

    let mut node = match Node::new(config, chain, identity) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to open node database: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = node.start() {
        error!("failed to start node: {e}");
        std::process::exit(1);
    }

    console(&node);

    if let Err(e) = node.shutdown() {
        error!("shutdown failed: {e}");
        std::process::exit(1);
    }
}

fn console(node: &Node) {
    println!("commands: route <addr> [host:port] | table | peers | node <addr> | suggest | connect <host:port> | quit");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("route") => {
                let Some(destination) = parse_addr(parts.next()) else {
                    println!("usage: route <addr> [host:port]");
                    continue;
                };
                let result = match parts.next() {
                    Some(dial) => node.find_route_at(destination, dial),
                    None => node.find_route(destination),
                };
                match result {
                    Ok(route) => {
                        println!("route to {destination}");
                        println!("maximum capacity: {}", route.capacity);
                        for (i, hop) in route.hops.iter().enumerate() {
                            println!("hop {i}: {hop}");
                        }
                    }
                    Err(e) => println!("route failed: {e}"),
                }
            }
            Some("table") => {
                let db = node.db();
                let db = db.read();
                for (i, entry) in db.routing_entries().iter().enumerate() {
                    println!(
                        "#{i} destination {} next hop {} capacity {} height {}",
                        entry.destination, entry.next_hop, entry.capacity, entry.height
                    );
                }
            }
            Some("peers") => {
                let db = node.db();
                let db = db.read();
                for (address, peer) in db.sessions() {
                    println!("{address} {peer}");
                }
            }
            Some("node") => {
                let Some(address) = parse_addr(parts.next()) else {
                    println!("usage: node <addr>");
                    continue;
                };
                let db = node.db();
                let db = db.read();
                match db.address_node(address) {
                    Some(peer) => println!("{peer}"),
                    None => println!("{address} is not a registered address"),
                }
            }
            Some("suggest") => match node.registration_suggestions() {
                Ok(suggestions) if suggestions.is_empty() => {
                    println!("no registered neighbors; any free address may be registered");
                }
                Ok(suggestions) => {
                    for (neighbor, suggested) in suggestions {
                        println!("neighbor {neighbor} suggests {suggested}");
                    }
                }
                Err(e) => println!("suggest failed: {e}"),
            },
            Some("connect") => match parts.next() {
                Some(addr) => {
                    if let Err(e) = node.connect_peer(addr) {
                        println!("connect failed: {e}");
                    }
                }
                None => println!("usage: connect <host:port>"),
            },
            Some("quit") | Some("exit") => return,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }
}

fn parse_addr(arg: Option<&str>) -> Option<OverlayAddr> {
    arg.and_then(|s| s.parse().ok())
}
