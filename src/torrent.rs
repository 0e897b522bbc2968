//! # Torrent State
//!
//! This module handles torrent file parsing, tracker communication, and the
//! on-disk piece store shared by the leecher and the seeder.
//!
//! ## Torrent File Format
//!
//! Torrent files contain metadata in bencoded format:
//!
//! - **announce**: Tracker URL for peer discovery
//! - **announce-list**: Optional tracker tiers (BEP 12)
//! - **info**: Dictionary with file information and piece hashes
//! - **pieces**: Concatenated SHA-1 hashes for integrity verification
//! - **piece length**: Size of each piece
//! - **length**: Total file size
//! - **name**: Suggested filename
//!
//! ## Piece Store
//!
//! The content lives in exactly one backing file, named by the torrent and
//! pre-sized to the full content length. Pieces occupy their natural offsets,
//! so the file is partially populated while the download runs. All access is
//! positional: the collector writes completed pieces at their offset, seeder
//! upload tasks read blocks at theirs, and neither needs a shared cursor.
//!
//! The local bitfield records which pieces are verified on disk. There is no
//! sidecar state: resuming an interrupted download means re-hashing every
//! piece range at startup and setting the bits that match.

use crate::bitfield::Bitfield;
use crate::error::{Error, Result};
use crate::peer::{self, Peer};

use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use url::Url;

use rand::seq::SliceRandom;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

// Size of a SHA-1 hash in bytes
pub const SHA1_HASH_SIZE: usize = 20;

/// A torrent and its on-disk piece store.
///
/// Built once per run and shared behind an `Arc` by the leecher collector
/// (which writes pieces) and the seeder handlers (which read blocks and
/// advertise the bitfield).
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    pub tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    pub info_hash: Vec<u8>,
    /// One 20-byte SHA-1 hash per piece
    pub piece_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    pub piece_length: u32,
    /// Total size of the content in bytes
    pub length: u32,
    /// Backing file name from the torrent metadata
    pub name: String,
    /// Read-write backing file holding the content at natural offsets
    pub file: File,
    /// Pieces verified on disk; written by the collector, read by seeders
    pub bitfield: RwLock<Bitfield>,
}

/// BencodeInfo structure.
#[derive(Deserialize, Serialize)]
struct BencodeInfo {
    // Concatenation of all pieces 20-byte SHA-1 hashes
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
    // Size of each piece in bytes
    #[serde(rename = "piece length")]
    piece_length: u32,
    // Size of the file in bytes
    #[serde(rename = "length")]
    length: u32,
    // Suggested filename where to save the file
    #[serde(rename = "name")]
    name: String,
}

/// BencodeTorrent structure.
#[derive(Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    // URL of the tracker
    announce: String,
    #[serde(rename = "announce-list", default)]
    // List of tracker URL tiers
    announce_list: Vec<Vec<String>>,
    // Informations about the file
    info: BencodeInfo,
}

/// BencodeTracker structure.
#[derive(Debug, Deserialize, Serialize)]
struct BencodeTracker {
    // Interval time to refresh the list of peers in seconds
    interval: u32,
    // Compact peer list
    peers: ByteBuf,
}

impl BencodeInfo {
    /// Hash the bencoded info dictionary to uniquely identify the content.
    fn hash(&self) -> Result<Vec<u8>> {
        // Serialize bencoded informations
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)
            .map_err(|_| Error::Config("could not encode info dictionary".into()))?;

        // Hash bencoded informations
        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finalize().to_vec())
    }

    /// Split the concatenated piece hashes into one 20-byte hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let pieces = &self.pieces;

        // Check torrent pieces
        if !pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(Error::Config(format!(
                "malformed pieces of length {}",
                pieces.len()
            )));
        }

        let hashes = pieces
            .chunks_exact(SHA1_HASH_SIZE)
            .map(|hash| hash.to_vec())
            .collect();

        Ok(hashes)
    }
}

/// Sanitize a filename from untrusted metadata.
fn sanitize_filename(filename: &str) -> String {
    // Replace path separators to prevent directory traversal
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

impl Torrent {
    /// Open a torrent.
    ///
    /// Parses the metainfo, opens the backing file named by the torrent
    /// (creating and pre-sizing it when absent), and restores any pieces
    /// already present on disk into the local bitfield.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the .torrent file.
    ///
    pub fn open(filepath: &Path) -> Result<Torrent> {
        // Read torrent content in a buffer
        let mut torrent_file =
            File::open(filepath).map_err(|_| Error::Config("could not open torrent".into()))?;
        let mut buf = vec![];
        torrent_file
            .read_to_end(&mut buf)
            .map_err(|_| Error::Config("could not read torrent".into()))?;

        // Deserialize bencoded data from torrent
        let bencode = de::from_bytes::<BencodeTorrent>(&buf)
            .map_err(|_| Error::Config("could not decode torrent".into()))?;

        // Collect tracker tiers
        let tiers = if !bencode.announce_list.is_empty() {
            // Use announce-list, shuffle each tier as per BEP 12
            let mut tiers = bencode.announce_list.clone();
            let mut rng = rand::thread_rng();
            for tier in &mut tiers {
                tier.shuffle(&mut rng);
            }
            tiers
        } else if !bencode.announce.is_empty() {
            vec![vec![bencode.announce.clone()]]
        } else {
            vec![]
        };

        let info_hash = bencode.info.hash()?;
        let piece_hashes = bencode.info.split_pieces_hashes()?;
        let piece_length = bencode.info.piece_length;
        let length = bencode.info.length;
        let name = sanitize_filename(&bencode.info.name);

        // Check piece hashes cover the content exactly
        if piece_length == 0 {
            return Err(Error::Config("piece length cannot be zero".into()));
        }
        if piece_hashes.len() != length.div_ceil(piece_length) as usize {
            return Err(Error::Config(format!(
                "{} piece hashes cannot cover {} bytes in pieces of {}",
                piece_hashes.len(),
                length,
                piece_length
            )));
        }

        // Open the backing file, pre-sized to the content length
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&name)
            .map_err(Error::Storage)?;
        file.set_len(u64::from(length)).map_err(Error::Storage)?;

        let bitfield = RwLock::new(Bitfield::new(piece_hashes.len()));

        let torrent = Torrent {
            tiers,
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name,
            file,
            bitfield,
        };

        torrent.restore();

        Ok(torrent)
    }

    /// Get the number of pieces.
    pub fn nb_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Get the byte range `[begin, end)` a piece covers in the content.
    pub fn piece_bounds(&self, index: u32) -> (u32, u32) {
        let begin = index * self.piece_length;
        let mut end = begin + self.piece_length;

        // Only the last piece may be shorter
        if end > self.length {
            end = self.length;
        }

        (begin, end)
    }

    /// Get the size of a piece in bytes.
    pub fn piece_size(&self, index: u32) -> u32 {
        let (begin, end) = self.piece_bounds(index);
        end - begin
    }

    /// Mark every piece already present on disk in the local bitfield.
    ///
    /// Re-hashes each piece range of the backing file and sets the bit for
    /// those matching their expected hash. Read failures count as absent.
    pub fn restore(&self) {
        for index in 0..self.nb_pieces() as u32 {
            let (begin, _) = self.piece_bounds(index);

            let mut buf = vec![0; self.piece_size(index) as usize];
            if let Err(e) = self.file.read_exact_at(&mut buf, u64::from(begin)) {
                debug!("Could not read piece {} from disk: {}", index, e);
                continue;
            }

            let mut hasher = Sha1::new();
            hasher.update(&buf);

            if hasher.finalize().as_slice() == self.piece_hashes[index as usize].as_slice() {
                self.bitfield.write().unwrap().set_piece(index);
                info!("Restored piece {} from disk", index);
            }
        }
    }

    /// Request peers from the trackers.
    ///
    /// All trackers are queried in parallel and the peers they return are
    /// merged and deduplicated.
    ///
    /// # Arguments
    ///
    /// * `peer_id` - 20-byte unique ID for the client.
    /// * `port` - Port number that the client is listening on.
    ///
    pub fn request_peers(&self, peer_id: &[u8], port: u16) -> Result<Vec<Peer>> {
        // Flatten all tiers into a unique list of tracker URLs
        let mut unique_urls = HashSet::new();
        for tier in &self.tiers {
            for tracker_url in tier {
                unique_urls.insert(tracker_url.clone());
            }
        }

        if unique_urls.is_empty() {
            return Err(Error::Config(
                "torrent has no announce or announce-list".into(),
            ));
        }

        // Shared storage for peer bytes from successful tracker responses
        let all_peers_bytes = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        // Query all trackers in parallel
        for tracker_url in unique_urls {
            let peer_id = peer_id.to_vec();
            let info_hash = self.info_hash.clone();
            let length = self.length;
            let all_peers_bytes = Arc::clone(&all_peers_bytes);

            let handle = thread::spawn(move || {
                // Build tracker URL
                let full_url =
                    match build_tracker_url(&info_hash, &tracker_url, &peer_id, port, length) {
                        Ok(full_url) => full_url,
                        Err(_) => return, // skip on error
                    };

                // Build blocking HTTP client
                let client = match reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(15))
                    .build()
                {
                    Ok(client) => client,
                    Err(_) => return, // skip on error
                };

                // Send GET request to the tracker
                let response = match client.get(&full_url).send() {
                    Ok(response) => match response.bytes() {
                        Ok(bytes) => bytes,
                        Err(_) => return, // skip on error
                    },
                    Err(_) => return, // skip on error
                };

                // Deserialize bencoded tracker response
                let tracker_bencode = match de::from_bytes::<BencodeTracker>(&response) {
                    Ok(tracker_bencode) => tracker_bencode,
                    Err(_) => return, // skip on error
                };

                // Store the peers bytes
                if let Ok(mut guard) = all_peers_bytes.lock() {
                    guard.push(tracker_bencode.peers.to_vec());
                }
            });

            handles.push(handle);
        }

        // Wait for all trackers to answer
        for handle in handles {
            let _ = handle.join();
        }

        // Collect all peers from the responses
        let all_peers_bytes = all_peers_bytes.lock().unwrap();
        let mut all_peers = Vec::new();
        for peers_bytes in all_peers_bytes.iter() {
            match peer::unmarshal(peers_bytes) {
                Ok(mut peers) => all_peers.append(&mut peers),
                Err(_) => continue, // skip invalid peers
            }
        }

        if all_peers.is_empty() {
            return Err(Error::Config(
                "could not get peers from any tracker".into(),
            ));
        }

        // Deduplicate peers
        let mut seen = HashSet::new();
        let peers: Vec<Peer> = all_peers
            .into_iter()
            .filter(|peer| seen.insert(*peer))
            .collect();

        Ok(peers)
    }
}

/// Build the announce URL for one tracker.
///
/// # Arguments
///
/// * `info_hash` - The 20-byte SHA-1 hash of the info dictionary.
/// * `announce` - The tracker URL.
/// * `peer_id` - 20-byte unique ID for the client.
/// * `port` - Port number that the client is listening on.
/// * `length` - Total content size in bytes.
///
fn build_tracker_url(
    info_hash: &[u8],
    announce: &str,
    peer_id: &[u8],
    port: u16,
    length: u32,
) -> Result<String> {
    /// Each byte is encoded as %XX where XX is its hexadecimal representation
    fn percent_encode_binary(data: &[u8]) -> String {
        const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
        let mut encoded = String::with_capacity(data.len() * 3);

        for &byte in data {
            encoded.push('%');
            encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            encoded.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
        }

        encoded
    }

    // Parse tracker URL from torrent
    let base_url = Url::parse(announce)
        .map_err(|_| Error::Config(format!("could not parse tracker url: {announce}")))?;

    // Build query string manually to handle binary data properly
    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1&event=started",
        percent_encode_binary(info_hash),
        percent_encode_binary(peer_id),
        port,
        length
    );

    let mut full_url = base_url.to_string();
    if full_url.contains('?') {
        full_url.push('&');
    } else {
        full_url.push('?');
    }
    full_url.push_str(&query);

    Ok(full_url)
}
