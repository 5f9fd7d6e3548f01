//! # Peer Download Worker
//!
//! One worker runs per established peer session and drives the per-peer
//! download state machine:
//!
//! 1. Take a piece from the shared work queue
//! 2. Hand it back if the peer does not have it
//! 3. Pipeline block requests (up to 5 outstanding) while unchoked
//! 4. Assemble inbound blocks into the piece buffer
//! 5. Verify the piece against its SHA-1 hash
//! 6. Post the verified piece on the result channel
//!
//! Recovery never retries in place: any failure puts the piece back at
//! the tail of the queue. An I/O or parse error also ends the worker,
//! since its session is no longer trustworthy; an integrity mismatch or
//! a missing piece keeps the worker alive for other pieces.

use crate::client::Client;
use crate::message::{
    self, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_KEEPALIVE, MESSAGE_PIECE, MESSAGE_UNCHOKE,
};
use crate::piece::{PieceProgress, PieceResult, PieceWork};

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, Sender};
use sha1::{Digest, Sha1};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// Maximum number of outstanding block requests per peer
const MAX_BACKLOG: u32 = 5;

// Largest block carried by a single request (16 KiB)
const MAX_BLOCK_SIZE: u32 = 16384;

// Wall-clock deadline on a single piece attempt, enough to get
// unresponsive peers unstuck
const PIECE_DEADLINE: Duration = Duration::from_secs(30);

/// Downloads pieces from a single peer session.
pub struct Worker {
    /// Session owned by this worker for its whole lifetime
    client: Client,
    /// Work queue shared with every other worker
    work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
    /// Completed pieces are posted here for assembly
    result_chan: Sender<PieceResult>,
    /// Workers still in the pool, decremented when this one exits
    nb_active: Arc<AtomicUsize>,
}

impl Worker {
    /// Build a new worker around an established session.
    pub fn new(
        client: Client,
        work_chan: (Sender<PieceWork>, Receiver<PieceWork>),
        result_chan: Sender<PieceResult>,
        nb_active: Arc<AtomicUsize>,
    ) -> Worker {
        Worker {
            client,
            work_chan,
            result_chan,
            nb_active,
        }
    }

    /// Run the download loop until the queue closes or the session fails.
    pub fn start_download(mut self) {
        self.run();

        // Signal that this session left the pool
        self.nb_active.fetch_sub(1, Ordering::SeqCst);
    }

    fn run(&mut self) {
        // Permanent unchoke, and declare interest once per session
        if self.client.send_unchoke().is_err() {
            return;
        }
        if self.client.send_interested().is_err() {
            return;
        }

        loop {
            // Receive a piece from work channel
            let piece_work: PieceWork = match self.work_chan.1.recv() {
                Ok(piece_work) => piece_work,
                Err(_) => {
                    info!("Worker exiting: work channel closed");
                    return;
                }
            };

            // Hand the piece back if the remote peer does not have it
            if !self.client.has_piece(piece_work.index) {
                if self.work_chan.0.send(piece_work).is_err() {
                    error!("Error: could not send piece back to work channel");
                    return;
                }
                continue;
            }

            // Download piece, the session is dead on failure
            let buf = match self.download_piece(&piece_work) {
                Ok(buf) => buf,
                Err(e) => {
                    warn!("Exiting worker: {}", e);
                    if self.work_chan.0.send(piece_work).is_err() {
                        error!("Error: could not send piece back to work channel");
                    }
                    return;
                }
            };

            // Verify piece integrity, the piece is requeued on mismatch
            if check_integrity(&piece_work, &buf).is_err() {
                warn!("Piece {:?} failed integrity check", piece_work.index);
                if self.work_chan.0.send(piece_work).is_err() {
                    error!("Error: could not send piece back to work channel");
                    return;
                }
                continue;
            }

            info!(
                "Successfully downloaded and verified piece {:?}",
                piece_work.index
            );

            // Notify peer that piece was downloaded
            if self.client.send_have(piece_work.index).is_err() {
                warn!("Could not notify peer that piece was downloaded");
            }

            // Post the verified piece for assembly
            let piece_result = PieceResult::new(piece_work.index, piece_work.length, buf);
            if self.result_chan.send(piece_result).is_err() {
                error!("Error: could not send piece to result channel");
                return;
            }
        }
    }

    /// Download a single piece under the per-attempt deadline.
    fn download_piece(&mut self, piece_work: &PieceWork) -> Result<Vec<u8>> {
        self.client.set_connection_timeout(Some(PIECE_DEADLINE))?;
        let attempt = self.attempt_download_piece(piece_work);
        self.client.set_connection_timeout(None)?;
        attempt
    }

    /// Drive the request pipeline until the piece is complete.
    fn attempt_download_piece(&mut self, piece_work: &PieceWork) -> Result<Vec<u8>> {
        let mut progress = PieceProgress::new(piece_work.index, piece_work.length);

        while progress.downloaded < piece_work.length {
            // While unchoked, keep the request pipeline full
            if !self.client.is_choked() {
                while progress.backlog < MAX_BACKLOG && progress.requested < piece_work.length {
                    // Last block of the piece may be short
                    let block_size = MAX_BLOCK_SIZE.min(piece_work.length - progress.requested);

                    self.client
                        .send_request(piece_work.index, progress.requested, block_size)?;
                    progress.backlog += 1;
                    progress.requested += block_size;
                }
            }

            self.read_message(&mut progress)?;
        }

        Ok(progress.buf)
    }

    /// Service one inbound message against the piece in progress.
    fn read_message(&mut self, progress: &mut PieceProgress) -> Result<()> {
        let message = self.client.read_message()?;

        match message.id {
            MESSAGE_CHOKE => self.client.read_choke(),
            MESSAGE_UNCHOKE => self.client.read_unchoke(),
            MESSAGE_HAVE => self.client.read_have(&message)?,
            MESSAGE_PIECE => {
                let n = message::parse_piece(progress.index, &mut progress.buf, &message)?;
                progress.downloaded += n;
                progress.backlog = progress.backlog.saturating_sub(1);
            }
            MESSAGE_KEEPALIVE => {}
            _ => debug!("Received unhandled message id {} from peer", message.id),
        }

        Ok(())
    }
}

/// Compare the SHA-1 of a downloaded piece against the torrent manifest.
pub fn check_integrity(piece_work: &PieceWork, buf: &[u8]) -> Result<()> {
    // Hash piece data
    let mut hasher = Sha1::new();
    hasher.update(buf);
    let hash = hasher.finalize();

    // Compare hashes
    if hash.as_slice() != piece_work.hash.as_slice() {
        return Err(anyhow!("piece {} failed integrity check", piece_work.index));
    }

    Ok(())
}
