//! # Marmot BitTorrent Peer
//!
//! A command-line BitTorrent peer written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Basic multitracker support
//! - Multi-peer concurrent downloading with pipelined block requests
//! - Piece verification with SHA-1 hashing
//! - Seeding of verified pieces while and after downloading
//! - Resumption by re-hashing the backing file at startup
//! - Progress tracking with visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! marmot <port> <torrent_file>
//! marmot <port> <torrent_file> --peer 127.0.0.1:6881
//! ```
//!
//! ## Architecture
//!
//! The peer follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, loads the torrent, collects
//!   downloaded pieces and writes them to disk
//! - **Worker threads**: Each handles downloading from one peer
//! - **Seeder threads**: One listener plus one handler per inbound peer
//! - **Channels**: Coordinate piece work distribution and result collection

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod error;
mod handshake;
mod leecher;
mod message;
mod peer;
mod piece;
mod seeder;
#[cfg(test)]
mod testutil;
mod torrent;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use clap::Parser;
use rand::Rng;

use crate::leecher::Leecher;
use crate::peer::Peer;
use crate::seeder::Seeder;
use crate::torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent peer, written in Rust."
)]
struct Args {
    /// Port to listen on for inbound peer connections
    port: u16,

    /// Path to the .torrent file
    torrent: PathBuf,

    /// Peer address (ip:port) to use instead of asking the trackers (repeatable)
    #[arg(long = "peer", value_name = "ADDR")]
    peers: Vec<Peer>,
}

/// Generate a random 20-byte peer id for this run.
fn generate_peer_id() -> Vec<u8> {
    let mut peer_id = vec![0; 20];
    let mut rng = rand::thread_rng();
    for x in peer_id.iter_mut() {
        *x = rng.gen();
    }
    peer_id
}

fn run(args: Args) -> Result<()> {
    // Load the torrent and restore any pieces already on disk
    let torrent = Arc::new(Torrent::open(&args.torrent)?);
    let peer_id = generate_peer_id();

    // Discover peers, unless a static list was given
    let peers = if args.peers.is_empty() {
        torrent.request_peers(&peer_id, args.port)?
    } else {
        args.peers.clone()
    };
    info!("Found {} peers", peers.len());

    // Serve pieces while (and after) downloading
    let seeder = Seeder::bind(Arc::clone(&torrent), peer_id.clone(), args.port)?;
    let seeding = thread::spawn(move || seeder.run());

    // Download every missing piece
    let leecher = Leecher::new(Arc::clone(&torrent), peers, peer_id);
    leecher.download()?;

    println!("Downloaded \"{}\", seeding until interrupted.", torrent.name);

    seeding
        .join()
        .map_err(|_| anyhow!("seeder thread panicked"))?;

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
