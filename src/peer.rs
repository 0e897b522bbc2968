//! # Peer Endpoints
//!
//! A peer is an `(IPv4 address, TCP port)` pair. Peers come either from the
//! tracker, which returns them in a compact binary format of 6-byte entries
//! (4 bytes of IP, 2 bytes of port, both big-endian), or from a static list
//! given on the command line.

use crate::error::{Error, Result};

use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

const PEER_SIZE: usize = 6;

/// Connection endpoint of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer listens on
    pub port: u16,
}

impl Peer {
    /// Get the socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl FromStr for Peer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Peer> {
        let addr: SocketAddrV4 = s
            .parse()
            .map_err(|_| Error::Config(format!("invalid peer address: {s}")))?;

        Ok(Peer {
            ip: *addr.ip(),
            port: addr.port(),
        })
    }
}

/// Parse a compact peer list returned by a tracker.
pub fn unmarshal(peers_bin: &[u8]) -> Result<Vec<Peer>> {
    // Check the peer list is made of whole entries
    if !peers_bin.len().is_multiple_of(PEER_SIZE) {
        return Err(Error::Config(
            "received malformed peers from tracker".into(),
        ));
    }

    let mut peers = Vec::with_capacity(peers_bin.len() / PEER_SIZE);

    for entry in peers_bin.chunks_exact(PEER_SIZE) {
        // Read peer IP address
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

        // Read peer port
        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor
            .read_u16::<BigEndian>()
            .map_err(|_| Error::Config("received malformed peers from tracker".into()))?;

        peers.push(Peer { ip, port });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarshal_parses_compact_entries() {
        let bin = [192, 168, 1, 1, 0x1f, 0x90, 10, 0, 0, 2, 0, 80];
        let peers = unmarshal(&bin).unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(peers[0].port, 8080);
        assert_eq!(peers[1].ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(peers[1].port, 80);
    }

    #[test]
    fn unmarshal_rejects_truncated_entries() {
        assert!(unmarshal(&[127, 0, 0, 1, 0]).is_err());
    }

    #[test]
    fn from_str_parses_socket_address() {
        let peer: Peer = "127.0.0.1:6881".parse().unwrap();
        assert_eq!(peer.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(peer.port, 6881);
        assert_eq!(peer.to_string(), "127.0.0.1:6881");

        assert!("not-a-peer".parse::<Peer>().is_err());
    }
}
