//! # Piece Bookkeeping
//!
//! Pieces are the verification units of a torrent: each one carries a
//! SHA-1 hash in the metadata and is downloaded in 16 KiB blocks. Three
//! records track a piece through its life: a work item on the shared
//! queue, the transient progress of one download attempt, and the final
//! verified result handed to the coordinator.

/// A piece waiting on the work queue.
///
/// Created once per piece at coordinator start and consumed exactly
/// once, when a verified copy of the piece reaches the coordinator.
#[derive(Debug, Clone)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece contents (20 bytes)
    pub hash: Vec<u8>,
    /// Length of the piece in bytes, the last piece may be short
    pub length: u32,
}

/// Transient state of a single download attempt on one peer.
#[derive(Debug)]
pub struct PieceProgress {
    /// Index of the piece being downloaded
    pub index: u32,
    /// Assembly buffer for the piece contents
    pub buf: Vec<u8>,
    /// Bytes received so far
    pub downloaded: u32,
    /// Bytes covered by the requests sent so far
    pub requested: u32,
    /// Outstanding unanswered block requests
    pub backlog: u32,
}

/// A fully downloaded and verified piece ready for assembly.
#[derive(Debug, Clone)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Length of the piece in bytes
    pub length: u32,
    /// Complete piece contents
    pub data: Vec<u8>,
}

impl PieceWork {
    /// Build a new work item.
    pub fn new(index: u32, hash: Vec<u8>, length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }
}

impl PieceProgress {
    /// Build fresh progress for an attempt at a piece.
    pub fn new(index: u32, length: u32) -> PieceProgress {
        PieceProgress {
            index,
            buf: vec![0; length as usize],
            downloaded: 0,
            requested: 0,
            backlog: 0,
        }
    }
}

impl PieceResult {
    /// Build a new result from completed download data.
    pub fn new(index: u32, length: u32, data: Vec<u8>) -> PieceResult {
        PieceResult {
            index,
            length,
            data,
        }
    }
}
