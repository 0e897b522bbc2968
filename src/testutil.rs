//! Shared fixtures for tests.

use crate::bitfield::Bitfield;
use crate::torrent::Torrent;

use sha1::{Digest, Sha1};

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::RwLock;

pub fn sha1_of(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

pub fn piece_hashes(content: &[u8], piece_length: u32) -> Vec<Vec<u8>> {
    content.chunks(piece_length as usize).map(sha1_of).collect()
}

/// Build a torrent over `content`, backed by a file at `path`.
///
/// With `with_content` the content is written out and restored into the
/// bitfield; otherwise the backing file is pre-sized and empty. Every
/// torrent built here shares one fixed info hash so loopback peers agree.
pub fn make_torrent(path: &Path, content: &[u8], piece_length: u32, with_content: bool) -> Torrent {
    let length = content.len() as u32;
    let piece_hashes = piece_hashes(content, piece_length);
    let nb_pieces = piece_hashes.len();

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .unwrap();
    file.set_len(u64::from(length)).unwrap();
    if with_content {
        file.write_all_at(content, 0).unwrap();
    }

    let torrent = Torrent {
        tiers: vec![],
        info_hash: vec![7; 20],
        piece_hashes,
        piece_length,
        length,
        name: path.to_str().unwrap().to_string(),
        file,
        bitfield: RwLock::new(Bitfield::new(nb_pieces)),
    };

    if with_content {
        torrent.restore();
    }

    torrent
}
