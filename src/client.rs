//! # Peer Connection
//!
//! This module implements the client side of the peer wire protocol: dialing
//! a peer, exchanging handshakes, adopting the peer's initial bitfield, and
//! the per-message send and receive helpers the download workers drive.
//!
//! ## Connection Establishment
//!
//! A connection becomes usable in three steps, each under its own deadline:
//!
//! 1. **Dial**: TCP connect, 3 seconds
//! 2. **Handshake**: send ours, read theirs, verify the info hash, 3 seconds
//! 3. **Bitfield**: read exactly one BITFIELD message, 5 seconds
//!
//! Deadlines are cleared once the connection is established; the download
//! loop re-arms them per piece.
//!
//! ## Connection State
//!
//! A connection starts choked: the peer will not answer requests until it
//! sends UNCHOKE. The peer's bitfield is updated as HAVE messages arrive, so
//! availability checks stay current over the life of the connection.

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::handshake::{self, Handshake};
use crate::message::{self, Message, MESSAGE_BITFIELD, MESSAGE_HAVE};
use crate::peer::Peer;

use byteorder::{BigEndian, ReadBytesExt};

use std::io::{Cursor, Write};
use std::net::TcpStream;
use std::time::Duration;

// Seconds allowed for the TCP connect
const DIAL_TIMEOUT_SECS: u64 = 3;
// Seconds allowed for the handshake exchange
const HANDSHAKE_TIMEOUT_SECS: u64 = 3;
// Seconds allowed for the initial bitfield
const BITFIELD_TIMEOUT_SECS: u64 = 5;

/// A connection to a remote peer.
///
/// Owns the TCP stream and the per-connection protocol state: the peer's
/// advertised bitfield and the choke flag.
pub struct Client {
    /// Remote peer endpoint
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Pieces the peer advertises
    bitfield: Bitfield,
    /// Whether the peer is choking us
    choked: bool,
    /// Largest message frame accepted from this peer
    frame_limit: usize,
}

impl Client {
    /// Dial a remote peer.
    ///
    /// Establishes the TCP connection with a 3-second timeout. The returned
    /// client is choked and has an empty peer bitfield until
    /// [`handshake_with_peer`](Client::handshake_with_peer) and
    /// [`read_bitfield`](Client::read_bitfield) complete.
    ///
    /// # Arguments
    ///
    /// * `peer` - Peer endpoint to connect to.
    /// * `peer_id` - 20-byte unique identifier for this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    /// * `piece_length` - Piece size, bounding accepted message frames.
    ///
    pub fn new(peer: Peer, peer_id: Vec<u8>, info_hash: Vec<u8>, piece_length: u32) -> Result<Client> {
        // Open connection with remote peer
        let conn = TcpStream::connect_timeout(
            &peer.socket_addr(),
            Duration::from_secs(DIAL_TIMEOUT_SECS),
        )
        .map_err(Error::Transport)?;

        info!("Connected to peer {}", peer);

        Ok(Client {
            peer,
            peer_id,
            info_hash,
            conn,
            bitfield: Bitfield::default(),
            choked: true,
            frame_limit: message::frame_limit(piece_length),
        })
    }

    /// Check whether the peer is choking us.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Check whether the peer advertises a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Set read and write timeouts on the connection.
    pub fn set_connection_timeout(&self, secs: u64) -> Result<()> {
        let timeout = Some(Duration::from_secs(secs));
        self.conn.set_write_timeout(timeout).map_err(Error::Transport)?;
        self.conn.set_read_timeout(timeout).map_err(Error::Transport)?;

        Ok(())
    }

    /// Clear read and write timeouts on the connection.
    pub fn clear_connection_timeout(&self) -> Result<()> {
        self.conn.set_write_timeout(None).map_err(Error::Transport)?;
        self.conn.set_read_timeout(None).map_err(Error::Transport)?;

        Ok(())
    }

    /// Exchange handshakes with the remote peer.
    ///
    /// Sends our handshake, reads the peer's reply under a 3-second deadline
    /// and verifies both sides agree on the info hash.
    ///
    /// # Errors
    ///
    /// A mismatched info hash is a protocol violation; the caller drops the
    /// connection.
    pub fn handshake_with_peer(&mut self) -> Result<()> {
        self.set_connection_timeout(HANDSHAKE_TIMEOUT_SECS)?;

        // Send handshake to remote peer
        let handshake = Handshake::new(self.peer_id.clone(), self.info_hash.clone());
        self.conn
            .write_all(&handshake.serialize())
            .map_err(Error::Transport)?;

        // Read handshake received from remote peer
        let reply = handshake::read(&mut self.conn)?;

        // Check info hash received from remote peer
        if reply.info_hash != self.info_hash {
            return Err(Error::Protocol(format!(
                "info hash mismatch from peer {}",
                self.peer
            )));
        }

        Ok(())
    }

    /// Read the peer's initial bitfield.
    ///
    /// Exactly one BITFIELD message is expected, under a 5-second deadline.
    /// On success all connection deadlines are cleared and the client is
    /// ready for the download loop.
    pub fn read_bitfield(&mut self) -> Result<()> {
        self.set_connection_timeout(BITFIELD_TIMEOUT_SECS)?;

        let message = message::read(&mut self.conn, self.frame_limit)?;
        if message.id != MESSAGE_BITFIELD {
            return Err(Error::Protocol(format!(
                "expected MESSAGE_BITFIELD (id {MESSAGE_BITFIELD}), got id {}",
                message.id
            )));
        }

        info!("Received MESSAGE_BITFIELD from peer {}", self.peer);

        // Adopt the advertised bitfield
        self.bitfield = Bitfield::from_bytes(message.payload);

        self.clear_connection_timeout()?;

        Ok(())
    }

    /// Read one message from the peer.
    pub fn read_message(&mut self) -> Result<Message> {
        message::read(&mut self.conn, self.frame_limit)
    }

    /// Process a CHOKE message from the peer.
    pub fn read_choke(&mut self) {
        info!("Received MESSAGE_CHOKE from peer {}", self.peer);
        self.choked = true
    }

    /// Process an UNCHOKE message from the peer.
    pub fn read_unchoke(&mut self) {
        info!("Received MESSAGE_UNCHOKE from peer {}", self.peer);
        self.choked = false
    }

    /// Process a HAVE message and record the piece in the peer's bitfield.
    pub fn read_have(&mut self, message: &Message) -> Result<()> {
        // Check if message id and payload are valid
        if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
            return Err(Error::Protocol(
                "received invalid MESSAGE_HAVE from peer".into(),
            ));
        }

        // Get piece index
        let mut payload_cursor = Cursor::new(&message.payload);
        let index = payload_cursor
            .read_u32::<BigEndian>()
            .map_err(Error::Transport)?;

        // An index past the advertised bitfield is a protocol violation
        if !self.bitfield.in_range(index) {
            return Err(Error::Protocol(format!(
                "MESSAGE_HAVE for piece {index} outside the advertised bitfield"
            )));
        }

        self.bitfield.set_piece(index);

        Ok(())
    }

    /// Send an UNCHOKE message to the peer.
    pub fn send_unchoke(&mut self) -> Result<()> {
        debug!("Sending MESSAGE_UNCHOKE to peer {}", self.peer);
        self.send_message(&Message::new(message::MESSAGE_UNCHOKE))
    }

    /// Send an INTERESTED message to the peer.
    ///
    /// Required before the peer will unchoke us and honor requests.
    pub fn send_interested(&mut self) -> Result<()> {
        debug!("Sending MESSAGE_INTERESTED to peer {}", self.peer);
        self.send_message(&Message::new(message::MESSAGE_INTERESTED))
    }

    /// Send a HAVE message announcing a piece we now hold.
    pub fn send_have(&mut self, index: u32) -> Result<()> {
        debug!("Sending MESSAGE_HAVE for piece {} to peer {}", index, self.peer);

        let payload = index.to_be_bytes().to_vec();
        self.send_message(&Message::new_with_payload(MESSAGE_HAVE, payload))
    }

    /// Send a REQUEST message for one block.
    ///
    /// # Arguments
    ///
    /// * `index` - Zero-based piece index.
    /// * `begin` - Byte offset of the block within the piece.
    /// * `length` - Number of bytes requested.
    ///
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        debug!(
            "Sending MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );

        self.send_message(&message::format_request(index, begin, length))
    }

    fn send_message(&mut self, message: &Message) -> Result<()> {
        self.conn
            .write_all(&message.serialize())
            .map_err(Error::Transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::TcpListener;
    use std::thread;

    fn local_peer(listener: &TcpListener) -> Peer {
        let addr = listener.local_addr().unwrap();
        Peer {
            ip: std::net::Ipv4Addr::LOCALHOST,
            port: addr.port(),
        }
    }

    #[test]
    fn handshake_rejects_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        // Remote side answers the handshake for a different torrent
        let remote = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = handshake::read(&mut stream).unwrap();
            let reply = Handshake::new(vec![9; 20], vec![0xee; 20]);
            stream.write_all(&reply.serialize()).unwrap();
        });

        let mut client = Client::new(peer, vec![1; 20], vec![2; 20], 16384).unwrap();
        assert!(matches!(
            client.handshake_with_peer(),
            Err(Error::Protocol(_))
        ));

        remote.join().unwrap();
    }

    #[test]
    fn read_bitfield_requires_a_bitfield_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let remote = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let _ = handshake::read(&mut stream).unwrap();
            let reply = Handshake::new(vec![9; 20], vec![2; 20]);
            stream.write_all(&reply.serialize()).unwrap();
            // Unchoke instead of the expected bitfield
            stream
                .write_all(&Message::new(message::MESSAGE_UNCHOKE).serialize())
                .unwrap();
        });

        let mut client = Client::new(peer, vec![1; 20], vec![2; 20], 16384).unwrap();
        client.handshake_with_peer().unwrap();
        assert!(matches!(client.read_bitfield(), Err(Error::Protocol(_))));

        remote.join().unwrap();
    }

    #[test]
    fn have_messages_extend_the_peer_bitfield() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = local_peer(&listener);

        let remote = thread::spawn(move || {
            let (_stream, _) = listener.accept().unwrap();
            // Keep the socket open until the client is done
            thread::sleep(std::time::Duration::from_millis(200));
        });

        let mut client = Client::new(peer, vec![1; 20], vec![2; 20], 16384).unwrap();
        client.bitfield = Bitfield::from_bytes(vec![0b1000_0000]);

        let have = Message::new_with_payload(MESSAGE_HAVE, 5u32.to_be_bytes().to_vec());
        client.read_have(&have).unwrap();
        assert!(client.has_piece(5));

        // Index past the advertised bitfield
        let have = Message::new_with_payload(MESSAGE_HAVE, 800u32.to_be_bytes().to_vec());
        assert!(client.read_have(&have).is_err());

        remote.join().unwrap();
    }
}
