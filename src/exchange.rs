//! # Piece Exchange
//!
//! Coordinates the download of every piece of the content from a set of peers.
//!
//! ## Architecture
//!
//! - **Picker**: one [`PieceWork`] per piece, seeded in index order (see
//!   [`crate::picker`])
//! - **Workers**: one thread per peer (see [`crate::worker`])
//! - **Event channel**: workers report verified pieces and their own exit
//!
//! [`Exchange::start`] returns a [`Download`], an iterator over verified
//! pieces in arrival order. Each index is yielded exactly once. If pieces are
//! still pending once every worker has exited, the iterator yields
//! [`ExchangeError::NoPeersAvailable`] instead of waiting forever.
//!
//! [`Exchange::download`] drives that iterator and assembles the content in
//! memory.

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::peer::{Peer, PEER_ID_SIZE};
use crate::picker::PiecePicker;
use crate::piece::{calculate_bounds, calculate_piece_size, PieceResult, PieceWork, HASH_SIZE};
use crate::worker::{Worker, WorkerEvent};

use crossbeam_channel::{unbounded, Receiver};
use std::sync::Arc;
use std::thread;

/// Immutable description of the pieces to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Content hash sent in every handshake
    pub info_hash: [u8; HASH_SIZE],
    /// Expected SHA-1 hash of every piece, in index order
    pub piece_hashes: Vec<[u8; HASH_SIZE]>,
    /// Size of every piece but the last
    pub piece_length: u32,
    /// Total content length in bytes
    pub length: u64,
}

impl Descriptor {
    /// Builds a descriptor, checking that the hashes cover exactly `length` bytes.
    pub fn new(
        info_hash: [u8; HASH_SIZE],
        piece_hashes: Vec<[u8; HASH_SIZE]>,
        piece_length: u32,
        length: u64,
    ) -> Result<Descriptor, ExchangeError> {
        if piece_length == 0 {
            return Err(ExchangeError::InvalidDescriptor(
                "piece length cannot be 0".to_string(),
            ));
        }

        let expected = length.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            return Err(ExchangeError::InvalidDescriptor(format!(
                "{} bytes in pieces of {} need {} hashes, got {}",
                length,
                piece_length,
                expected,
                piece_hashes.len()
            )));
        }

        if u32::try_from(piece_hashes.len()).is_err() {
            return Err(ExchangeError::InvalidDescriptor(format!(
                "too many pieces: {}",
                piece_hashes.len()
            )));
        }

        Ok(Descriptor {
            info_hash,
            piece_hashes,
            piece_length,
            length,
        })
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece within the content.
    pub fn bounds(&self, index: u32) -> (u64, u64) {
        calculate_bounds(self.piece_length, self.length, index)
    }

    pub fn piece_size(&self, index: u32) -> u32 {
        calculate_piece_size(self.piece_length, self.length, index)
    }

    fn work(&self) -> impl Iterator<Item = PieceWork> + '_ {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| {
                let index = index as u32;
                PieceWork::new(index, *hash, self.piece_size(index))
            })
    }
}

/// A download of one piece set from a list of peers.
pub struct Exchange {
    descriptor: Descriptor,
    peers: Vec<Peer>,
    peer_id: [u8; PEER_ID_SIZE],
    config: ExchangeConfig,
}

impl Exchange {
    pub fn new(descriptor: Descriptor, peers: Vec<Peer>, peer_id: [u8; PEER_ID_SIZE]) -> Exchange {
        Exchange::with_config(descriptor, peers, peer_id, ExchangeConfig::default())
    }

    pub fn with_config(
        descriptor: Descriptor,
        peers: Vec<Peer>,
        peer_id: [u8; PEER_ID_SIZE],
        config: ExchangeConfig,
    ) -> Exchange {
        Exchange {
            descriptor,
            peers,
            peer_id,
            config,
        }
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Seeds the picker and starts one worker thread per peer.
    ///
    /// # Errors
    ///
    /// Returns [`ExchangeError::InvalidConfig`] if the configuration cannot
    /// drive a download. Peer failures are never returned here; they surface
    /// through the [`Download`] iterator.
    pub fn start(self) -> Result<Download, ExchangeError> {
        self.config.validate()?;

        let piece_count = self.descriptor.piece_count();
        info!(
            "Starting download of {} pieces from {} peers",
            piece_count,
            self.peers.len()
        );

        let picker = Arc::new(PiecePicker::new(self.descriptor.work()));
        let (events_tx, events_rx) = unbounded::<WorkerEvent>();

        // Workers stay idle for an empty piece set, which completes immediately
        let peers = if piece_count == 0 { vec![] } else { self.peers };
        let alive = peers.len();

        for peer in peers {
            let worker = Worker::new(
                peer,
                self.peer_id,
                self.descriptor.info_hash,
                self.config,
                Arc::clone(&picker),
                events_tx.clone(),
            );

            thread::spawn(move || worker.run());
        }

        Ok(Download {
            events: events_rx,
            picker,
            delivered: vec![false; piece_count],
            remaining: piece_count,
            alive,
            failures: 0,
            rejected: 0,
            cancelled: false,
            finished: false,
        })
    }

    /// Downloads every piece and assembles them into one buffer.
    ///
    /// `progress` is called once per verified piece, in arrival order.
    pub fn download<F>(self, mut progress: F) -> Result<Vec<u8>, ExchangeError>
    where
        F: FnMut(&PieceResult),
    {
        let length = usize::try_from(self.descriptor.length).map_err(|_| {
            ExchangeError::InvalidDescriptor(format!(
                "{} bytes do not fit in memory",
                self.descriptor.length
            ))
        })?;
        let descriptor = self.descriptor.clone();

        let mut buf = vec![0u8; length];
        for result in self.start()? {
            let piece = result?;
            let (begin, end) = descriptor.bounds(piece.index);
            buf[begin as usize..end as usize].copy_from_slice(&piece.data);
            progress(&piece);
        }

        Ok(buf)
    }
}

/// A running download. Yields each verified piece exactly once.
///
/// Dropping the handle closes the picker. Idle workers stop right away. A
/// worker in the middle of a piece stops at its next message, or once its read
/// deadline expires, which takes at most `piece_timeout`.
pub struct Download {
    events: Receiver<WorkerEvent>,
    /// Closed to tell workers to stop
    picker: Arc<PiecePicker>,
    delivered: Vec<bool>,
    remaining: usize,
    /// Workers that have not reported their exit yet
    alive: usize,
    /// Workers that exited on an error
    failures: usize,
    /// Pieces that failed verification and were queued again
    rejected: usize,
    cancelled: bool,
    finished: bool,
}

impl Download {
    /// Number of pieces not delivered yet.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Number of peer sessions that ended on an error so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Number of pieces discarded after failing verification so far.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Stops all workers. The iterator then yields
    /// [`ExchangeError::Cancelled`] once, unless the download already finished.
    pub fn cancel(&mut self) {
        if !self.picker.is_closed() && !self.finished && self.remaining > 0 {
            info!("Cancelling download with {} pieces pending", self.remaining);
            self.cancelled = true;
        }
        self.picker.close();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.picker.close();
    }

    fn handle(&mut self, event: WorkerEvent) -> Option<PieceResult> {
        match event {
            WorkerEvent::Completed(piece) => {
                match self.delivered.get_mut(piece.index as usize) {
                    Some(delivered) if !*delivered => {
                        *delivered = true;
                        self.remaining -= 1;
                        return Some(piece);
                    }
                    _ => warn!("Discard duplicate or unknown piece {}", piece.index),
                }
            }
            WorkerEvent::Rejected { peer, index } => {
                self.rejected += 1;
                debug!("Piece {} from peer {} was rejected", index, peer);
            }
            WorkerEvent::Exited { peer, error } => {
                self.alive = self.alive.saturating_sub(1);
                if let Some(e) = error {
                    self.failures += 1;
                    warn!("Lost peer {}: {}", peer, e);
                }
                debug!("{} workers still running", self.alive);
            }
        }
        None
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        self.picker.close();
    }
}

impl Iterator for Download {
    type Item = Result<PieceResult, ExchangeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if self.cancelled {
            self.finish();
            return Some(Err(ExchangeError::Cancelled));
        }

        loop {
            if self.remaining == 0 {
                info!("All pieces downloaded");
                self.finish();
                return None;
            }

            if self.alive == 0 {
                error!("No peer left with {} pieces pending", self.remaining);
                self.finish();
                return Some(Err(ExchangeError::NoPeersAvailable {
                    remaining: self.remaining,
                    failures: self.failures,
                }));
            }

            match self.events.recv() {
                Ok(event) => {
                    if let Some(piece) = self.handle(event) {
                        if self.remaining == 0 {
                            // Release idle workers right away
                            self.picker.close();
                        }
                        return Some(Ok(piece));
                    }
                }
                // Every worker is gone, including any that failed to report
                Err(_) => self.alive = 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: usize) -> Vec<[u8; HASH_SIZE]> {
        vec![[0; HASH_SIZE]; n]
    }

    #[test]
    fn descriptor_checks_piece_count() {
        assert!(Descriptor::new([0; 20], hashes(2), 100, 150).is_ok());
        assert!(Descriptor::new([0; 20], hashes(10), 100, 1000).is_ok());
        assert!(Descriptor::new([0; 20], hashes(0), 100, 0).is_ok());

        assert!(matches!(
            Descriptor::new([0; 20], hashes(1), 100, 150),
            Err(ExchangeError::InvalidDescriptor(_))
        ));
        assert!(Descriptor::new([0; 20], hashes(3), 100, 150).is_err());
        assert!(Descriptor::new([0; 20], hashes(1), 0, 150).is_err());
    }

    #[test]
    fn work_is_seeded_in_index_order() {
        let descriptor = Descriptor::new([0; 20], hashes(3), 100, 250).unwrap();
        let work: Vec<(u32, u32)> = descriptor.work().map(|w| (w.index, w.length)).collect();
        assert_eq!(work, vec![(0, 100), (1, 100), (2, 50)]);
    }

    #[test]
    fn empty_descriptor_completes_without_peers() {
        let descriptor = Descriptor::new([0; 20], vec![], 100, 0).unwrap();
        let exchange = Exchange::new(descriptor, vec![], [0; 20]);
        assert_eq!(exchange.download(|_| {}).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn no_peers_is_reported_not_awaited() {
        let descriptor = Descriptor::new([0; 20], hashes(2), 100, 150).unwrap();
        let mut download = Exchange::new(descriptor, vec![], [0; 20]).start().unwrap();

        assert!(matches!(
            download.next(),
            Some(Err(ExchangeError::NoPeersAvailable {
                remaining: 2,
                failures: 0
            }))
        ));
        assert!(download.next().is_none());
    }

    #[test]
    fn cancel_yields_one_error() {
        let descriptor = Descriptor::new([0; 20], hashes(2), 100, 150).unwrap();
        let mut download = Exchange::new(descriptor, vec![], [0; 20]).start().unwrap();

        download.cancel();
        assert!(matches!(download.next(), Some(Err(ExchangeError::Cancelled))));
        assert!(download.next().is_none());
    }

    #[test]
    fn duplicate_pieces_are_delivered_once() {
        let (events_tx, events_rx) = unbounded();
        let peer = Peer::new([127, 0, 0, 1].into(), 6881);
        let mut download = Download {
            events: events_rx,
            picker: Arc::new(PiecePicker::default()),
            delivered: vec![false; 2],
            remaining: 2,
            alive: 1,
            failures: 0,
            rejected: 0,
            cancelled: false,
            finished: false,
        };

        let piece = |index: u32| WorkerEvent::Completed(PieceResult::new(index, vec![index as u8]));
        events_tx.send(piece(1)).unwrap();
        events_tx.send(piece(1)).unwrap();
        events_tx
            .send(WorkerEvent::Rejected { peer, index: 0 })
            .unwrap();
        events_tx.send(piece(0)).unwrap();

        assert_eq!(download.next().unwrap().unwrap().index, 1);
        assert_eq!(download.next().unwrap().unwrap().index, 0);
        assert!(download.next().is_none());
        assert_eq!(download.rejected(), 1);
        assert!(download.picker.is_closed());
    }

    #[test]
    fn dropping_the_download_closes_the_picker() {
        let descriptor = Descriptor::new([0; 20], hashes(2), 100, 150).unwrap();
        let download = Exchange::new(descriptor, vec![], [0; 20]).start().unwrap();
        let picker = Arc::clone(&download.picker);

        assert!(!picker.is_closed());
        assert_eq!(picker.pending(), 2);
        drop(download);
        assert!(picker.is_closed());
    }

    #[test]
    fn invalid_config_is_rejected_before_starting() {
        let descriptor = Descriptor::new([0; 20], hashes(2), 100, 150).unwrap();
        let config = ExchangeConfig {
            backlog: 0,
            ..Default::default()
        };
        let exchange = Exchange::with_config(descriptor, vec![], [0; 20], config);
        assert!(matches!(
            exchange.start(),
            Err(ExchangeError::InvalidConfig(_))
        ));
    }
}
