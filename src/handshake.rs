//! # BitTorrent Handshake Protocol
//!
//! This module implements the initial handshake used to establish
//! communication between BitTorrent peers.
//!
//! ## Message Format
//!
//! The handshake is a fixed-layout message of 49 + pstrlen bytes:
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of the protocol string (19)
//! - **pstr**: Variable - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros, reserved for protocol extensions
//! - **info_hash**: 20 bytes - SHA-1 hash of the torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! The info hash is what ties a connection to a swarm: both sides must agree
//! on it or the connection is torn down. Verifying that agreement is the
//! caller's job, this module only moves the frame on and off the wire.

use crate::error::{Error, Result};

use std::io::Read;

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A BitTorrent handshake message.
///
/// Sent by both sides immediately after TCP connection establishment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Length of the protocol identifier string (19)
    pub pstrlen: usize,
    /// Protocol identifier bytes ("BitTorrent protocol")
    pub pstr: Vec<u8>,
    /// 8 reserved bytes, all zeros
    pub reserved: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte unique identifier for this peer
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a new handshake with the standard protocol string.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte unique identifier for this client.
    /// * `info_hash` - 20-byte SHA-1 hash of the torrent's info dictionary.
    ///
    pub fn new(peer_id: Vec<u8>, info_hash: Vec<u8>) -> Self {
        // Get pstr
        let pstr = String::from(PROTOCOL_ID).into_bytes();
        // Get pstrlen
        let pstrlen = pstr.len();
        // Get reserved
        let reserved: Vec<u8> = vec![0; 8];

        Handshake {
            pstrlen,
            pstr,
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Serialize the handshake for network transmission.
    ///
    /// Concatenates all fields in wire order. The result is always
    /// 49 + pstrlen bytes (68 bytes for the standard protocol string).
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(49 + self.pstrlen);

        // Add pstrlen
        serialized.push(self.pstrlen as u8);

        // Add pstr
        serialized.extend_from_slice(&self.pstr);

        // Add reserved
        serialized.extend_from_slice(&self.reserved);

        // Add info hash
        serialized.extend_from_slice(&self.info_hash);

        // Add peer id
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }
}

/// Read and decode one handshake from a stream.
///
/// # Errors
///
/// Returns a transport error on a short read and a protocol error when the
/// peer announces a zero-length protocol string.
pub fn read<R: Read>(reader: &mut R) -> Result<Handshake> {
    // Read pstrlen
    let mut len_buf = [0; 1];
    reader.read_exact(&mut len_buf).map_err(Error::Transport)?;

    let pstrlen = len_buf[0] as usize;
    if pstrlen == 0 {
        return Err(Error::Protocol(
            "handshake with a zero-length protocol string".into(),
        ));
    }

    // Read the remainder of the frame
    let mut handshake_buf = vec![0; 48 + pstrlen];
    reader
        .read_exact(&mut handshake_buf)
        .map_err(Error::Transport)?;

    Ok(deserialize_handshake(&handshake_buf, pstrlen))
}

/// Split a received handshake buffer into its fields.
///
/// The buffer must hold exactly the 48 + pstrlen bytes that follow the
/// pstrlen byte on the wire.
pub fn deserialize_handshake(buf: &[u8], pstrlen: usize) -> Handshake {
    // Get pstr
    let pstr = buf[0..pstrlen].to_vec();
    // Get reserved
    let reserved = buf[pstrlen..(pstrlen + 8)].to_vec();
    // Get info hash
    let info_hash = buf[(pstrlen + 8)..(pstrlen + 8 + 20)].to_vec();
    // Get peer id
    let peer_id = buf[(pstrlen + 8 + 20)..].to_vec();

    Handshake {
        pstrlen,
        pstr,
        reserved,
        info_hash,
        peer_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    #[test]
    fn serialize_then_read_round_trips() {
        let handshake = Handshake::new(vec![1; 20], vec![2; 20]);
        let serialized = handshake.serialize();
        assert_eq!(serialized.len(), 68);
        assert_eq!(serialized[0], 19);

        let mut cursor = Cursor::new(serialized);
        let decoded = read(&mut cursor).unwrap();
        assert_eq!(decoded, handshake);
        assert_eq!(decoded.pstr, b"BitTorrent protocol");
        assert_eq!(decoded.reserved, vec![0; 8]);
    }

    #[test]
    fn read_rejects_zero_pstrlen() {
        let mut cursor = Cursor::new(vec![0u8; 68]);
        assert!(matches!(read(&mut cursor), Err(Error::Protocol(_))));
    }

    #[test]
    fn read_surfaces_truncated_frames_as_transport_errors() {
        let mut cursor = Cursor::new(vec![19u8, b'B', b'i', b't']);
        assert!(matches!(read(&mut cursor), Err(Error::Transport(_))));
    }
}
