//! # Seeder
//!
//! This module serves pieces to remote peers. It binds a TCP listener and
//! gives every accepted connection its own handler thread.
//!
//! ## Serving Protocol
//!
//! 1. **Handshake**: read the peer's handshake, verify the info hash, and
//!    echo ours back
//! 2. **Bitfield**: advertise exactly the pieces verified on disk
//! 3. **Unchoke**: this seeder unchokes every peer unconditionally
//! 4. **Uploads**: every REQUEST message spawns an upload task that reads
//!    the block from the backing file and answers with a PIECE message
//!
//! ## Concurrency
//!
//! Upload tasks read the backing file at absolute offsets, so they need no
//! coordination with the collector writing other pieces of the same file.
//! Socket writes are serialized through a per-connection mutex to keep
//! concurrent upload frames from interleaving.

use crate::error::{Error, Result};
use crate::handshake::{self, Handshake};
use crate::message::{self, Message, MESSAGE_BITFIELD, MESSAGE_REQUEST, MESSAGE_UNCHOKE};
use crate::torrent::Torrent;

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Seconds allowed for the inbound handshake
const HANDSHAKE_TIMEOUT_SECS: u64 = 3;

/// Serves verified pieces to inbound peer connections.
pub struct Seeder {
    /// Shared torrent state and piece store
    torrent: Arc<Torrent>,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// Listener accepting inbound peer connections
    listener: TcpListener,
}

impl Seeder {
    /// Bind the seeder listener.
    ///
    /// # Arguments
    ///
    /// * `torrent` - Torrent to serve.
    /// * `peer_id` - 20-byte unique identifier for this client.
    /// * `port` - Port to listen on; 0 picks an ephemeral port.
    ///
    pub fn bind(torrent: Arc<Torrent>, peer_id: Vec<u8>, port: u16) -> Result<Seeder> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(Error::Transport)?;

        Ok(Seeder {
            torrent,
            peer_id,
            listener,
        })
    }

    /// Get the address the seeder listens on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::Transport)
    }

    /// Accept and serve inbound connections, indefinitely.
    pub fn run(self) {
        info!("Seeding {}", self.torrent.name);

        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Could not accept connection: {}", e);
                    continue;
                }
            };

            let torrent = Arc::clone(&self.torrent);
            let peer_id = self.peer_id.clone();

            thread::spawn(move || {
                let remote = stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_string());

                debug!("Accepted connection from {}", remote);

                if let Err(e) = handle_connection(torrent, peer_id, stream) {
                    debug!("Closing connection from {}: {}", remote, e);
                }
            });
        }
    }
}

/// Serve one inbound peer connection.
fn handle_connection(torrent: Arc<Torrent>, peer_id: Vec<u8>, mut stream: TcpStream) -> Result<()> {
    // Read the peer handshake and check we serve the same torrent
    stream
        .set_read_timeout(Some(Duration::from_secs(HANDSHAKE_TIMEOUT_SECS)))
        .map_err(Error::Transport)?;

    let received = handshake::read(&mut stream)?;
    if received.info_hash != torrent.info_hash {
        return Err(Error::Protocol(
            "info hash mismatch in inbound handshake".into(),
        ));
    }

    // Echo our handshake back
    let reply = Handshake::new(peer_id, torrent.info_hash.clone());
    stream
        .write_all(&reply.serialize())
        .map_err(Error::Transport)?;

    // Advertise the pieces verified on disk
    let bitfield = torrent.bitfield.read().unwrap().as_bytes().to_vec();
    stream
        .write_all(&Message::new_with_payload(MESSAGE_BITFIELD, bitfield).serialize())
        .map_err(Error::Transport)?;

    // Unchoke unconditionally
    stream
        .write_all(&Message::new(MESSAGE_UNCHOKE).serialize())
        .map_err(Error::Transport)?;

    // The peer may now idle between requests
    stream.set_read_timeout(None).map_err(Error::Transport)?;

    // Upload tasks share the socket through a mutex so their frames never
    // interleave
    let writer = Arc::new(Mutex::new(stream.try_clone().map_err(Error::Transport)?));
    let frame_limit = message::frame_limit(torrent.piece_length);

    loop {
        let message = message::read(&mut stream, frame_limit)?;
        if message.id != MESSAGE_REQUEST {
            // Keep-alives and everything else are ignored
            continue;
        }

        let torrent = Arc::clone(&torrent);
        let writer = Arc::clone(&writer);

        thread::spawn(move || {
            if let Err(e) = upload(&torrent, &writer, &message) {
                debug!("Upload failed: {}", e);
                // Shut the socket down so the handler unblocks and closes
                let conn = writer.lock().unwrap();
                let _ = conn.shutdown(Shutdown::Both);
            }
        });
    }
}

/// Answer one block request from the backing file.
fn upload(torrent: &Torrent, writer: &Mutex<TcpStream>, message: &Message) -> Result<()> {
    let request = message::parse_request(message, torrent.piece_length, torrent.length)?;

    // Read the requested range at its absolute offset
    let mut block = vec![0; request.length as usize];
    torrent
        .file
        .read_exact_at(&mut block, request.begin)
        .map_err(Error::Storage)?;

    let piece = message::format_piece(request.index, request.block_begin, &block);

    let mut conn = writer.lock().unwrap();
    conn.write_all(&piece.serialize()).map_err(Error::Transport)?;

    debug!(
        "Uploaded piece {} [{}:{}]",
        request.index,
        request.block_begin,
        request.block_begin + request.length
    );

    Ok(())
}
