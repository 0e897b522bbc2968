//! # Download Worker
//!
//! This module implements the worker that downloads pieces from a single
//! peer. Each worker owns one connection and runs until the download
//! completes or its peer fails.
//!
//! ## Download Process
//!
//! 1. **Connection**: TCP dial, handshake, initial bitfield
//! 2. **Interest**: send UNCHOKE and INTERESTED so the peer starts serving
//! 3. **Work loop**: claim a piece, download it block by block, verify it
//! 4. **Results**: verified pieces go to the collector for write-back
//!
//! ## Pipelining
//!
//! Blocks of up to 16 KiB are requested five at a time while the peer keeps
//! us unchoked. The backlog refills as PIECE messages arrive, which keeps the
//! link busy without flooding the peer.
//!
//! ## Failure Containment
//!
//! A worker never takes the download down with it. Whatever it was holding
//! goes back on the work queue first: on connection errors the worker exits
//! and the piece is retried elsewhere, on an integrity failure only the piece
//! is retried and the peer is kept, since its other pieces may be fine.

use crate::client::Client;
use crate::error::{Error, Result};
use crate::message::{
    self, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_KEEPALIVE, MESSAGE_PIECE, MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::piece::{PieceProgress, PieceResult, PieceWork};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use sha1::{Digest, Sha1};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// Maximum number of concurrent block requests per peer
const NB_REQUESTS_MAX: u32 = 5;

// Standard block size for piece downloads (16KB)
const BLOCK_SIZE_MAX: u32 = 16384;

// Seconds allowed to download one full piece
const PIECE_TIMEOUT_SECS: u64 = 30;

// Pause before reclaiming work from a peer that lacks the piece
const REQUEUE_BACKOFF_MS: u64 = 50;

// How often an idle worker checks for shutdown
const SHUTDOWN_POLL_SECS: u64 = 1;

/// Downloads pieces from a single peer.
///
/// Runs in its own thread, claiming work from the shared queue and sending
/// verified pieces to the collector.
pub struct Worker {
    /// Remote peer endpoint
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: Vec<u8>,
    /// Piece size of the torrent, bounding accepted message frames
    piece_length: u32,
    /// Channel for claiming piece work and returning failed work
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Channel for sending verified piece results
    result_chan: Sender<PieceResult>,
    /// Raised by the collector once the download is complete
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: Vec<u8>,
        info_hash: Vec<u8>,
        piece_length: u32,
        work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
        result_chan: Sender<PieceResult>,
        shutdown: Arc<AtomicBool>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            piece_length,
            work_chan,
            result_chan,
            shutdown,
        }
    }

    /// Connect to the peer and download pieces until done.
    ///
    /// All failures are confined to this worker: they are logged, the
    /// in-flight piece is requeued, and the thread exits.
    pub fn run(&self) {
        // Connect and prepare the peer
        let mut client = match self.connect() {
            Ok(client) => client,
            Err(e) => {
                debug!("Could not prepare peer {}: {}", self.peer, e);
                return;
            }
        };

        info!("Completed handshake with peer {}", self.peer);

        loop {
            // Claim a piece from the work queue
            let piece_work = match self.work_chan.1.recv_timeout(Duration::from_secs(SHUTDOWN_POLL_SECS)) {
                Ok(piece_work) => piece_work,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };

            // Check if the remote peer has the piece
            if !client.has_piece(piece_work.index) {
                self.requeue(piece_work);
                // Let another worker pick it up instead of spinning
                thread::sleep(Duration::from_millis(REQUEUE_BACKOFF_MS));
                continue;
            }

            // Download the piece
            let buf = match attempt_download_piece(&mut client, &piece_work) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!("Disconnecting from peer {}: {}", self.peer, e);
                    self.requeue(piece_work);
                    return;
                }
            };

            // Verify piece integrity
            if let Err(e) = check_integrity(&piece_work, &buf) {
                warn!("{} (from peer {})", e, self.peer);
                self.requeue(piece_work);
                continue;
            }

            // Notify the peer that we now hold the piece
            if let Err(e) = client.send_have(piece_work.index) {
                debug!("Could not send MESSAGE_HAVE to peer {}: {}", self.peer, e);
            }

            // Send the piece to the collector
            let piece_result = PieceResult::new(piece_work.index, buf);
            if self.result_chan.send(piece_result).is_err() {
                // Collector is gone, the download is over
                return;
            }
        }
    }

    /// Dial the peer and run the connection preamble.
    fn connect(&self) -> Result<Client> {
        let mut client = Client::new(
            self.peer,
            self.peer_id.clone(),
            self.info_hash.clone(),
            self.piece_length,
        )?;

        client.handshake_with_peer()?;
        client.read_bitfield()?;

        client.send_unchoke()?;
        client.send_interested()?;

        Ok(client)
    }

    /// Put a piece back on the work queue.
    fn requeue(&self, piece_work: PieceWork) {
        if self.work_chan.0.send(piece_work).is_err() {
            // Every endpoint is gone, the download is over
            debug!("Work queue closed, dropping requeued piece");
        }
    }
}

/// Download one piece over an established connection.
///
/// Runs under a 30-second socket deadline. While the peer keeps us unchoked,
/// block requests are pipelined up to the backlog limit; incoming messages
/// are folded into the piece progress until the buffer is complete.
fn attempt_download_piece(client: &mut Client, piece_work: &PieceWork) -> Result<Vec<u8>> {
    let mut progress = PieceProgress::new(piece_work);

    // A deadline helps get unresponsive peers unstuck
    client.set_connection_timeout(PIECE_TIMEOUT_SECS)?;

    while progress.downloaded < piece_work.length {
        // If unchoked, top the request pipeline up
        if !client.is_choked() {
            while progress.backlog < NB_REQUESTS_MAX && progress.requested < piece_work.length {
                // The trailing block may be shorter than a full one
                let block_size = BLOCK_SIZE_MAX.min(piece_work.length - progress.requested);

                client.send_request(piece_work.index, progress.requested, block_size)?;

                progress.backlog += 1;
                progress.requested += block_size;
            }
        }

        // Fold the next message into the progress
        let message = client.read_message()?;
        match message.id {
            MESSAGE_KEEPALIVE => {}
            MESSAGE_CHOKE => client.read_choke(),
            MESSAGE_UNCHOKE => client.read_unchoke(),
            MESSAGE_HAVE => client.read_have(&message)?,
            MESSAGE_PIECE => {
                let n = message::parse_piece(piece_work.index, &mut progress.buf, &message)?;
                progress.downloaded += n as u32;
                // An unsolicited block must not wrap the backlog around
                progress.backlog = progress.backlog.saturating_sub(1);
            }
            id => debug!("Ignoring message with id {} from peer", id),
        }
    }

    client.clear_connection_timeout()?;

    info!("Downloaded piece {}", piece_work.index);

    Ok(progress.buf)
}

/// Check a downloaded piece against its expected hash.
fn check_integrity(piece_work: &PieceWork, buf: &[u8]) -> Result<()> {
    let mut hasher = Sha1::new();
    hasher.update(buf);

    if hasher.finalize().as_slice() != piece_work.hash.as_slice() {
        return Err(Error::Integrity {
            index: piece_work.index,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::bitfield::Bitfield;
    use crate::handshake::{self, Handshake};
    use crate::message::{Message, MESSAGE_BITFIELD, MESSAGE_REQUEST};
    use crate::testutil;

    use std::io::Write;
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// A scripted peer that seeds `content` and records every block request
    /// it receives, answering them only once `expected_requests` have piled
    /// up. This pins down the request pattern the download loop produces.
    fn scripted_seeder(
        listener: TcpListener,
        content: Vec<u8>,
        piece_length: u32,
        expected_requests: usize,
    ) -> JoinHandle<Vec<(u32, u32, u32)>> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            // Handshake
            let remote = handshake::read(&mut stream).unwrap();
            let reply = Handshake::new(vec![9; 20], remote.info_hash.clone());
            stream.write_all(&reply.serialize()).unwrap();

            // Advertise everything
            let nb_pieces = content.len().div_ceil(piece_length as usize);
            let mut bitfield = Bitfield::new(nb_pieces);
            for index in 0..nb_pieces as u32 {
                bitfield.set_piece(index);
            }
            let advert =
                Message::new_with_payload(MESSAGE_BITFIELD, bitfield.as_bytes().to_vec());
            stream.write_all(&advert.serialize()).unwrap();
            stream
                .write_all(&Message::new(message::MESSAGE_UNCHOKE).serialize())
                .unwrap();

            // Collect the whole request pipeline before answering
            let mut requests = Vec::new();
            let frame_limit = message::frame_limit(piece_length);
            while requests.len() < expected_requests {
                let message = message::read(&mut stream, frame_limit).unwrap();
                if message.id != MESSAGE_REQUEST {
                    // Ignore anything that is not a block request
                    continue;
                }
                let request =
                    message::parse_request(&message, piece_length, content.len() as u32).unwrap();
                requests.push((request.index, request.block_begin, request.length));
            }

            for &(index, begin, length) in &requests {
                let offset = index as usize * piece_length as usize + begin as usize;
                let block = &content[offset..offset + length as usize];
                let piece = message::format_piece(index, begin, block);
                stream.write_all(&piece.serialize()).unwrap();
            }

            requests
        })
    }

    fn connect_client(listener: &TcpListener, info_hash: Vec<u8>, piece_length: u32) -> Client {
        let addr = listener.local_addr().unwrap();
        let peer = Peer {
            ip: std::net::Ipv4Addr::LOCALHOST,
            port: addr.port(),
        };

        let mut client = Client::new(peer, vec![1; 20], info_hash, piece_length).unwrap();
        client.handshake_with_peer().unwrap();
        client.read_bitfield().unwrap();
        client
    }

    #[test]
    fn small_piece_is_fetched_with_a_single_request() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let content = vec![0x42; 100];
        let hash = testutil::sha1_of(&content);

        let seeder = scripted_seeder(listener.try_clone().unwrap(), content.clone(), 100, 1);

        let mut client = connect_client(&listener, vec![7; 20], 100);
        let piece_work = PieceWork::new(0, hash, 100);
        let buf = attempt_download_piece(&mut client, &piece_work).unwrap();

        assert_eq!(buf, content);
        assert_eq!(seeder.join().unwrap(), vec![(0, 0, 100)]);
    }

    #[test]
    fn large_piece_pipelines_block_requests() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let content = vec![0x37; 65536];
        let hash = testutil::sha1_of(&content);

        // Four 16 KiB blocks fit the pipeline, so all requests land up front
        let seeder = scripted_seeder(listener.try_clone().unwrap(), content.clone(), 65536, 4);

        let mut client = connect_client(&listener, vec![7; 20], 65536);
        let piece_work = PieceWork::new(0, hash.clone(), 65536);
        let buf = attempt_download_piece(&mut client, &piece_work).unwrap();

        assert_eq!(buf.len(), 65536);
        assert!(check_integrity(&piece_work, &buf).is_ok());
        assert_eq!(
            seeder.join().unwrap(),
            vec![
                (0, 0, 16384),
                (0, 16384, 16384),
                (0, 32768, 16384),
                (0, 49152, 16384),
            ]
        );
    }

    #[test]
    fn corrupted_piece_fails_the_integrity_check() {
        let piece_work = PieceWork::new(3, testutil::sha1_of(b"expected"), 9);
        assert!(matches!(
            check_integrity(&piece_work, b"corrupted"),
            Err(Error::Integrity { index: 3 })
        ));
    }

    #[test]
    fn peer_that_dies_mid_piece_surfaces_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let accept_from = listener.try_clone().unwrap();

        // Accept the preamble, swallow one request, then vanish
        let remote = thread::spawn(move || {
            let (mut stream, _) = accept_from.accept().unwrap();
            let received = handshake::read(&mut stream).unwrap();
            let reply = Handshake::new(vec![9; 20], received.info_hash.clone());
            stream.write_all(&reply.serialize()).unwrap();

            let advert = Message::new_with_payload(MESSAGE_BITFIELD, vec![0b1000_0000]);
            stream.write_all(&advert.serialize()).unwrap();
            stream
                .write_all(&Message::new(message::MESSAGE_UNCHOKE).serialize())
                .unwrap();

            let _ = message::read(&mut stream, 1 << 20);
        });

        let mut client = connect_client(&listener, vec![7; 20], 20000);
        let piece_work = PieceWork::new(0, testutil::sha1_of(&[0; 20000]), 20000);
        assert!(matches!(
            attempt_download_piece(&mut client, &piece_work),
            Err(Error::Transport(_))
        ));

        remote.join().unwrap();
    }
}
