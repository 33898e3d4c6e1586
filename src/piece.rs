//! # BitTorrent Piece Management
//!
//! Pieces are the verification units of the torrent data. They are requested
//! from peers in smaller blocks (16KB by default).
//!
//! - [`PieceWork`]: a queued download job, owned by one worker at a time
//! - [`PieceProgress`]: request/receive counters and the assembly buffer for
//!   the piece a worker is currently downloading
//! - [`PieceResult`]: a verified piece, handed to the assembler exactly once

use sha1::{Digest, Sha1};

/// Size of a SHA-1 piece hash in bytes
pub const HASH_SIZE: usize = 20;

/// A piece waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Expected SHA-1 hash of the piece
    pub hash: [u8; HASH_SIZE],
    /// Total length of the piece in bytes
    pub length: u32,
}

impl PieceWork {
    pub fn new(index: u32, hash: [u8; HASH_SIZE], length: u32) -> PieceWork {
        PieceWork {
            index,
            hash,
            length,
        }
    }

    /// Checks downloaded data against the expected hash.
    pub fn verify(&self, data: &[u8]) -> bool {
        let digest = Sha1::digest(data);
        digest.as_slice() == &self.hash[..]
    }
}

/// A downloaded and verified piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceResult {
    /// Zero-based index of this piece in the torrent
    pub index: u32,
    /// Complete piece data
    pub data: Vec<u8>,
}

impl PieceResult {
    pub fn new(index: u32, data: Vec<u8>) -> PieceResult {
        PieceResult { index, data }
    }
}

/// Download state of the piece a worker is currently fetching.
///
/// The piece is split into blocks of `block_size` bytes (the last one may be
/// shorter). Each block is tracked on its own, so blocks may arrive in any
/// order and a duplicate answer is never counted twice.
#[derive(Debug)]
pub struct PieceProgress {
    /// Index of the piece being downloaded
    pub index: u32,
    /// Assembly buffer, sized to the piece length
    pub buf: Vec<u8>,
    /// Bytes of distinct blocks received so far
    pub downloaded: u32,
    /// Requests sent but not yet answered
    pub backlog: u32,
    block_size: u32,
    requested: Vec<bool>,
    received: Vec<bool>,
}

impl PieceProgress {
    pub fn new(work: &PieceWork, block_size: u32) -> PieceProgress {
        let blocks = work.length.div_ceil(block_size.max(1)) as usize;
        PieceProgress {
            index: work.index,
            buf: vec![0; work.length as usize],
            downloaded: 0,
            backlog: 0,
            block_size: block_size.max(1),
            requested: vec![false; blocks],
            received: vec![false; blocks],
        }
    }

    fn length(&self) -> u32 {
        self.buf.len() as u32
    }

    /// `(begin, length)` of a block.
    fn block(&self, block: usize) -> (u32, u32) {
        let begin = block as u32 * self.block_size;
        (begin, self.block_size.min(self.length() - begin))
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&received| received)
    }

    /// Reserves the next block to request as `(begin, length)`.
    ///
    /// Returns `None` once every missing block has been requested.
    pub fn next_block(&mut self) -> Option<(u32, u32)> {
        let block = (0..self.requested.len())
            .find(|&block| !self.requested[block] && !self.received[block])?;

        self.requested[block] = true;
        self.backlog += 1;

        Some(self.block(block))
    }

    /// Accounts for a block of `len` bytes received at offset `begin`.
    ///
    /// Returns `false` when the block was already received or does not match
    /// a block boundary; such blocks are not counted.
    pub fn record_block(&mut self, begin: u32, len: usize) -> bool {
        if begin % self.block_size != 0 {
            return false;
        }
        let block = (begin / self.block_size) as usize;
        if block >= self.received.len() || self.block(block).1 as usize != len {
            return false;
        }
        if self.received[block] {
            return false;
        }

        self.received[block] = true;
        self.downloaded += len as u32;
        if self.requested[block] {
            self.backlog = self.backlog.saturating_sub(1);
        }
        true
    }

    /// Forgets unanswered requests. Peers discard them when they choke us.
    pub fn reset_requests(&mut self) {
        for (requested, &received) in self.requested.iter_mut().zip(&self.received) {
            if !received {
                *requested = false;
            }
        }
        self.backlog = 0;
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}

/// Byte range `[begin, end)` of a piece within the whole content.
///
/// Both bounds are clamped to `length`, so the result is always a valid range.
pub fn calculate_bounds(piece_length: u32, length: u64, index: u32) -> (u64, u64) {
    let begin = (index as u64 * piece_length as u64).min(length);
    let end = (begin + piece_length as u64).min(length);
    (begin, end)
}

/// Size of a piece in bytes. Only the last piece may be shorter than `piece_length`.
pub fn calculate_piece_size(piece_length: u32, length: u64, index: u32) -> u32 {
    let (begin, end) = calculate_bounds(piece_length, length, index);
    (end - begin) as u32
}
