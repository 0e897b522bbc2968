//! # Leecher
//!
//! This module coordinates the download: it fans piece work out across one
//! worker per peer and funnels verified pieces back to a single collector
//! that writes them to disk.
//!
//! ## Scheduling
//!
//! Two bounded channels tie the pipeline together:
//!
//! - **Work queue**: every missing piece enters once; workers claim pieces
//!   and put back whatever they cannot finish, so a dead peer never loses
//!   work. Both channels are sized to the piece count, which keeps every
//!   send non-blocking.
//! - **Results**: verified pieces, consumed only by the collector.
//!
//! Pieces are claimed in queue order, with no rarity heuristics. A requeued
//! piece goes to the tail and is picked up by whichever worker is free.
//!
//! ## Write-back
//!
//! The collector is the only writer of the backing file and the local
//! bitfield. Pieces complete out of order and land at their natural offsets,
//! and a piece's bit is set only after its bytes are on disk. Completed work
//! is reflected in an `indicatif` progress bar.
//!
//! ## Termination
//!
//! The download succeeds once every piece is on disk; the collector then
//! raises the shutdown flag and workers drain away. If every worker exits
//! while pieces are still missing, the download fails as stalled rather than
//! waiting forever.

use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::torrent::Torrent;
use crate::worker::Worker;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use indicatif::{ProgressBar, ProgressStyle};

use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Downloads a torrent from a list of peers.
pub struct Leecher {
    /// Shared torrent state and piece store
    torrent: Arc<Torrent>,
    /// Peers to download from
    peers: Vec<Peer>,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
}

impl Leecher {
    /// Build a new leecher.
    pub fn new(torrent: Arc<Torrent>, peers: Vec<Peer>, peer_id: Vec<u8>) -> Leecher {
        Leecher {
            torrent,
            peers,
            peer_id,
        }
    }

    /// Download every missing piece of the torrent.
    ///
    /// Returns once the local bitfield is fully set. Pieces already on disk
    /// are skipped; if nothing is missing no connection is opened at all.
    pub fn download(&self) -> Result<()> {
        let nb_pieces = self.torrent.nb_pieces();

        info!("Downloading {} ({} pieces)", self.torrent.name, nb_pieces);

        // Create work and result channels, sized so no send ever blocks
        let (work_tx, work_rx) = bounded::<PieceWork>(nb_pieces);
        let (result_tx, result_rx) = bounded::<PieceResult>(nb_pieces);

        // Enqueue every missing piece
        let mut downloaded = 0;
        let mut restored_bytes: u64 = 0;
        {
            let bitfield = self.torrent.bitfield.read().unwrap();
            for index in 0..nb_pieces as u32 {
                if bitfield.has_piece(index) {
                    downloaded += 1;
                    restored_bytes += u64::from(self.torrent.piece_size(index));
                    continue;
                }

                let piece_work = PieceWork::new(
                    index,
                    self.torrent.piece_hashes[index as usize].clone(),
                    self.torrent.piece_size(index),
                );
                if work_tx.send(piece_work).is_err() {
                    return Err(Error::Stalled {
                        remaining: nb_pieces - downloaded,
                    });
                }
            }
        }

        if downloaded == nb_pieces {
            info!("All {} pieces already on disk", nb_pieces);
            return Ok(());
        }

        if self.peers.is_empty() {
            return Err(Error::Stalled {
                remaining: nb_pieces - downloaded,
            });
        }

        // Start one worker per peer
        let shutdown = Arc::new(AtomicBool::new(false));
        let live_workers = Arc::new(AtomicUsize::new(self.peers.len()));

        for peer in &self.peers {
            let worker = Worker::new(
                *peer,
                self.peer_id.clone(),
                self.torrent.info_hash.clone(),
                self.torrent.piece_length,
                (work_tx.clone(), work_rx.clone()),
                result_tx.clone(),
                Arc::clone(&shutdown),
            );
            let live_workers = Arc::clone(&live_workers);

            thread::spawn(move || {
                worker.run();
                live_workers.fetch_sub(1, Ordering::SeqCst);
            });
        }

        // Keep no queue endpoints here so the channels disconnect once the
        // workers are gone
        drop(work_tx);
        drop(work_rx);
        drop(result_tx);

        let result = self.collect(&result_rx, &live_workers, downloaded, restored_bytes);

        // Unblock any lingering workers
        shutdown.store(true, Ordering::SeqCst);

        result
    }

    /// Drain verified pieces and write them to the backing file.
    fn collect(
        &self,
        result_rx: &Receiver<PieceResult>,
        live_workers: &AtomicUsize,
        mut downloaded: usize,
        restored_bytes: u64,
    ) -> Result<()> {
        let nb_pieces = self.torrent.nb_pieces();

        // Create progress bar over content bytes, counting restored pieces
        let pb = ProgressBar::new(u64::from(self.torrent.length));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_position(restored_bytes);

        while downloaded < nb_pieces {
            // Receive a piece from the result channel
            let piece_result = match result_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(piece_result) => piece_result,
                Err(RecvTimeoutError::Timeout) => {
                    if live_workers.load(Ordering::SeqCst) == 0 {
                        return Err(Error::Stalled {
                            remaining: nb_pieces - downloaded,
                        });
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Stalled {
                        remaining: nb_pieces - downloaded,
                    });
                }
            };

            // Write the piece at its natural offset
            let (begin, _) = self.torrent.piece_bounds(piece_result.index);
            self.torrent
                .file
                .write_all_at(&piece_result.data, u64::from(begin))
                .map_err(Error::Storage)?;

            // The bit is set only once the piece is fully on disk
            self.torrent
                .bitfield
                .write()
                .unwrap()
                .set_piece(piece_result.index);

            downloaded += 1;
            pb.inc(piece_result.data.len() as u64);
            debug!(
                "({:.2}%) Downloaded piece {}",
                downloaded as f64 / nb_pieces as f64 * 100.0,
                piece_result.index
            );
        }

        pb.finish();
        info!("Finished downloading {}", self.torrent.name);

        Ok(())
    }
}
