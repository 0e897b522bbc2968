//! Crate-wide error types.
//!
//! Every failure the engine can hit maps to one variant, because recovery
//! differs per kind: transport and protocol failures drop the offending peer,
//! integrity failures requeue the piece but keep the peer, storage failures
//! abort the download, and configuration failures are fatal at startup.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Socket dial, read or write failure, including timeouts.
    #[error("peer transport failed: {0}")]
    Transport(#[source] std::io::Error),

    /// Malformed frame, unexpected message, or info-hash mismatch.
    #[error("peer protocol violation: {0}")]
    Protocol(String),

    /// A completed piece did not hash to its expected SHA-1 digest.
    #[error("piece {index} failed integrity check")]
    Integrity { index: u32 },

    /// Backing file read or write failure.
    #[error("storage failed: {0}")]
    Storage(#[source] std::io::Error),

    /// Malformed metainfo or tracker response.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Pieces are still missing but no worker is left to fetch them.
    #[error("download stalled with {remaining} pieces missing")]
    Stalled { remaining: usize },
}
