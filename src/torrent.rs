//! # Torrent Metadata and Download Coordination
//!
//! This module parses `.torrent` documents and coordinates the download:
//!
//! 1. **Parse** the bencoded metadata and extract the piece manifest
//! 2. **Announce** to the trackers and collect peers
//! 3. **Open sessions** with every reachable peer in parallel
//! 4. **Distribute work** to one worker per session over a shared queue
//! 5. **Assemble results** into the output buffer, piece by piece
//!
//! The work queue holds one entry per piece and workers hand entries
//! back on any failure, so a lost peer never loses a piece. The
//! assembly buffer is written only by the coordinator, at offsets
//! derived from the piece index.

use crate::client::Client;
use crate::keepalive::KeepAliveDriver;
use crate::peer::Peer;
use crate::piece::{PieceResult, PieceWork};
use crate::tracker;
use crate::worker::Worker;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// Port reported to trackers
const PORT: u16 = 6881;

// Size of a SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

// Keep-alive cadence, the convention is anything under two minutes
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(120);

// How often the coordinator checks on the worker pool while waiting
const STARVATION_CHECK_PERIOD: Duration = Duration::from_secs(5);

/// A parsed torrent, ready to be downloaded.
#[derive(Default, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// 20-byte SHA-1 hash of the bencoded info dictionary
    info_hash: Vec<u8>,
    /// One 20-byte SHA-1 hash per piece
    pieces_hashes: Vec<Vec<u8>>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total size of the file in bytes
    length: u32,
    /// Suggested filename from the torrent metadata
    name: String,
    /// 20-byte unique identifier for this client instance
    peer_id: Vec<u8>,
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
    // URL of the tracker
    #[serde(default)]
    announce: String,
    // Tiers of tracker URLs
    #[serde(rename = "announce-list", default)]
    announce_list: Vec<Vec<String>>,
    // Informations about file
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Hash bencoded informations to uniquely identify a file.
    fn hash(&self) -> Result<Vec<u8>> {
        // Serialize bencoded informations
        let buf: Vec<u8> = ser::to_bytes::<BencodeInfo>(self)?;

        // Hash bencoded informations
        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finalize().to_vec())
    }

    /// Split bencoded pieces into one SHA-1 hash per piece.
    fn split_pieces_hashes(&self) -> Result<Vec<Vec<u8>>> {
        // Check torrent pieces
        if !self.pieces.len().is_multiple_of(SHA1_HASH_SIZE) {
            return Err(anyhow!("torrent has malformed pieces"));
        }

        // Split pieces
        Ok(self
            .pieces
            .chunks(SHA1_HASH_SIZE)
            .map(|chunk| chunk.to_vec())
            .collect())
    }
}

impl Torrent {
    /// Returns the suggested filename from the torrent metadata.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a torrent file and parse its metadata.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the torrent.
    ///
    pub fn open(filepath: &Path) -> Result<Torrent> {
        // Open torrent
        let mut file = match File::open(filepath) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent")),
        };

        // Read torrent content in a buffer
        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent"));
        }

        Torrent::from_bytes(&buf)
    }

    /// Parse a bencoded torrent document.
    fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        // Deserialize bencoded data from torrent
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent")),
        };

        // Collect tracker tiers, shuffled within each tier as per BEP 12
        let mut tiers: Vec<Vec<String>>;
        if !bencode.announce_list.is_empty() {
            tiers = bencode.announce_list.clone();
            let mut rng = rand::thread_rng();
            for tier in &mut tiers {
                tier.shuffle(&mut rng);
            }
        } else if !bencode.announce.is_empty() {
            tiers = vec![vec![bencode.announce.clone()]];
        } else {
            return Err(anyhow!("torrent has no announce or announce-list"));
        }

        // Generate a random 20-byte peer id
        let mut peer_id: Vec<u8> = vec![0; 20];
        let mut rng = rand::thread_rng();
        for x in peer_id.iter_mut() {
            *x = rng.gen();
        }

        Ok(Torrent {
            tiers,
            info_hash: bencode.info.hash()?,
            pieces_hashes: bencode.info.split_pieces_hashes()?,
            piece_length: bencode.info.piece_length,
            length: bencode.info.length,
            name: bencode.info.name.clone(),
            peer_id,
        })
    }

    /// Discover peers, open sessions and run the download.
    pub fn download(&self) -> Result<Vec<u8>> {
        println!(
            "Downloading {:?} ({:?} pieces)",
            self.name,
            self.pieces_hashes.len(),
        );

        // Request peers from trackers
        let peers = tracker::request_peers(
            &self.tiers,
            &self.info_hash,
            &self.peer_id,
            PORT,
            self.length,
        )?;
        info!("Found {} peers", peers.len());

        // Open a session with every reachable peer
        let clients = self.connect_to_peers(peers);
        info!("Opened {} peer sessions", clients.len());

        self.download_from(clients)
    }

    /// Open sessions with every peer in parallel, keeping the ones that
    /// complete the handshake and bitfield exchange.
    pub fn connect_to_peers(&self, peers: Vec<Peer>) -> Vec<Client> {
        let clients = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        for peer in peers {
            let peer_id = self.peer_id.clone();
            let info_hash = self.info_hash.clone();
            let clients = Arc::clone(&clients);

            handles.push(thread::spawn(move || {
                match Client::new(peer, peer_id, info_hash) {
                    Ok(client) => clients.lock().unwrap().push(client),
                    Err(e) => debug!("Skipping peer: {}", e),
                }
            }));
        }

        // Wait for every dial to settle
        for handle in handles {
            let _ = handle.join();
        }

        let mut clients = clients.lock().unwrap();
        std::mem::take(&mut *clients)
    }

    /// Download the torrent from the given open sessions.
    pub fn download_from(&self, clients: Vec<Client>) -> Result<Vec<u8>> {
        if clients.is_empty() {
            return Err(anyhow!("no peers could be reached"));
        }

        let nb_pieces = self.pieces_hashes.len();

        // Work queue sized to hold every piece, results are unbounded
        let (work_tx, work_rx): (Sender<PieceWork>, Receiver<PieceWork>) = bounded(nb_pieces);
        let (result_tx, result_rx): (Sender<PieceResult>, Receiver<PieceResult>) = unbounded();

        // Seed the work queue with one entry per piece
        for (index, hash) in self.pieces_hashes.iter().enumerate() {
            let piece_index = index as u32;
            let piece_work =
                PieceWork::new(piece_index, hash.clone(), self.get_piece_length(piece_index));
            if work_tx.send(piece_work).is_err() {
                return Err(anyhow!("could not send piece to work channel"));
            }
        }

        // Start one worker per session, and keep a write handle on each
        // session for the keep-alive driver
        let nb_active = Arc::new(AtomicUsize::new(clients.len()));
        let mut keep_alive_senders = Vec::new();
        for client in clients {
            match client.keep_alive_sender() {
                Ok(sender) => keep_alive_senders.push(sender),
                Err(e) => debug!("Session without keep-alive: {}", e),
            }

            let worker = Worker::new(
                client,
                (work_tx.clone(), work_rx.clone()),
                result_tx.clone(),
                Arc::clone(&nb_active),
            );
            thread::spawn(move || worker.start_download());
        }
        KeepAliveDriver::new(keep_alive_senders, KEEP_ALIVE_PERIOD).spawn();

        // Create progress bar
        let pb = ProgressBar::new(self.length as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        // Assemble results until every piece is accounted for
        let mut data: Vec<u8> = vec![0; self.length as usize];
        let mut nb_pieces_downloaded = 0;
        let mut starvation_logged = false;
        while nb_pieces_downloaded < nb_pieces {
            // Receive a piece from result channel
            let piece_result: PieceResult = match result_rx.recv_timeout(STARVATION_CHECK_PERIOD) {
                Ok(piece_result) => piece_result,
                Err(RecvTimeoutError::Timeout) => {
                    // Every worker exited with pieces outstanding: the
                    // download can no longer finish on its own
                    if nb_active.load(Ordering::SeqCst) == 0 && !starvation_logged {
                        warn!(
                            "All peer workers exited, {} pieces are still missing",
                            nb_pieces - nb_pieces_downloaded
                        );
                        starvation_logged = true;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("could not receive piece from result channel"));
                }
            };

            // Copy piece data at its offset in the artifact
            let begin = piece_result.index as usize * self.piece_length as usize;
            let end = begin + piece_result.length as usize;
            data[begin..end].copy_from_slice(&piece_result.data);

            // Update progress bar
            pb.inc(piece_result.length as u64);

            // Update number of pieces downloaded
            nb_pieces_downloaded += 1;
        }

        Ok(data)
    }

    /// Length of the piece at `index`, the last piece may be short.
    fn get_piece_length(&self, index: u32) -> u32 {
        let begin: u32 = index * self.piece_length;
        let mut end: u32 = begin + self.piece_length;

        // Prevent unbounded values
        if end > self.length {
            end = self.length;
        }

        end - begin
    }
}
