//! Driftwood node CLI.
//!
//! Run a peer-to-peer file-store node.
//!
//! Usage:
//!   driftwood --listen 127.0.0.1:3000
//!   driftwood --listen 127.0.0.1:4000 --root ./node2 --bootstrap 127.0.0.1:3000

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;

use tracing::{error, info};

use driftwood_core::{Node, NodeConfig};

fn print_usage() {
    println!("Driftwood node v0.1.0");
    println!();
    println!("Usage:");
    println!("  driftwood --listen <ADDR>                     Run a seed node");
    println!("  driftwood --listen <ADDR> --bootstrap <ADDR>  Join an existing network");
    println!();
    println!("Options:");
    println!("  --listen <ADDR>      Address to listen on, e.g. 127.0.0.1:3000 (required)");
    println!("  --root <PATH>        Storage root directory (default: ./driftwood_data)");
    println!("  --bootstrap <ADDR>   Peer to dial on startup; may be repeated");
    println!("  --help, -h           Show this help");
}

fn parse_addr(flag: &str, value: Option<&String>) -> SocketAddr {
    let Some(value) = value else {
        eprintln!("Error: {flag} requires an address argument.");
        process::exit(1);
    };
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: {flag} got {value:?}, expected an address like 127.0.0.1:3000.");
        process::exit(1);
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = env::args().collect();

    let mut listen_addr: Option<SocketAddr> = None;
    let mut storage_root = PathBuf::from("./driftwood_data");
    let mut bootstrap_nodes: Vec<SocketAddr> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" => {
                listen_addr = Some(parse_addr("--listen", args.get(i + 1)));
                i += 2;
            }
            "--root" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: --root requires a path argument.");
                    process::exit(1);
                };
                storage_root = PathBuf::from(value);
                i += 2;
            }
            "--bootstrap" => {
                bootstrap_nodes.push(parse_addr("--bootstrap", args.get(i + 1)));
                i += 2;
            }
            "--help" | "-h" => {
                print_usage();
                return;
            }
            other => {
                eprintln!("Error: unknown argument {other:?}.");
                println!();
                print_usage();
                process::exit(1);
            }
        }
    }

    let Some(listen_addr) = listen_addr else {
        eprintln!("Error: --listen is required.");
        println!();
        print_usage();
        process::exit(1);
    };

    let mut config = NodeConfig::new(listen_addr, storage_root);
    config.bootstrap_nodes = bootstrap_nodes;

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "failed to start node");
            process::exit(1);
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    node.stop();
}
