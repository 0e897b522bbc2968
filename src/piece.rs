//! # Piece Scheduling Types
//!
//! Pieces are the verification units of the torrent and the currency of the
//! download scheduler. A missing piece circulates as a [`PieceWork`] on the
//! work queue until some worker downloads and verifies it, at which point it
//! travels to the collector as a [`PieceResult`]. While a worker is actively
//! fetching a piece it tracks its position in a [`PieceProgress`].

/// A missing piece, waiting on the work queue.
///
/// Work items move between the queue and a worker. A worker that fails puts
/// its item back on the queue so no piece is ever lost.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece (20 bytes)
    pub hash: Vec<u8>,
    /// Length of the piece in bytes
    pub length: u32,
}

/// A downloaded and verified piece, on its way to disk.
#[derive(Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Complete piece data
    pub data: Vec<u8>,
}

/// Transient download state of one piece on one connection.
///
/// Lives from the first block request to the last block received.
#[derive(Debug)]
pub struct PieceProgress {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Piece buffer, sized to the exact piece length
    pub buf: Vec<u8>,
    /// Bytes received and copied into the buffer so far
    pub downloaded: u32,
    /// Cumulative offset of the last block requested
    pub requested: u32,
    /// Requests sent but not yet answered
    pub backlog: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceResult {
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}

impl PieceProgress {
    /// Start tracking a fresh piece download.
    pub fn new(piece_work: &PieceWork) -> PieceProgress {
        PieceProgress {
            index: piece_work.index,
            buf: vec![0; piece_work.length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}
