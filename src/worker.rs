//! # BitTorrent Worker Thread
//!
//! This module implements the worker that downloads pieces from a single peer.
//! Each worker owns one peer connection and coordinates with the exchange
//! through the shared [`PiecePicker`] and an event channel.
//!
//! ## Worker Architecture
//!
//! - **One worker per peer**: each peer gets its own thread
//! - **Shared picker**: pieces are taken from, and put back into, one queue
//! - **Event channel**: verified pieces, rejected pieces and worker exits are
//!   reported back to the exchange
//!
//! ## Download Process
//!
//! 1. **Connection**: TCP connect, handshake, bitfield
//! 2. **Piece Selection**: take the first pending piece the peer has
//! 3. **Choke Management**: ask for unchoke, track choke/unchoke at any time
//! 4. **Piece Requests**: pipelined block requests, bounded by the backlog
//! 5. **Verification**: SHA-1 hash check against the torrent metadata
//! 6. **Result Reporting**: verified pieces go to the event channel
//!
//! While the only pieces this peer could serve are held by other workers, the
//! worker stays connected and keeps reading `have`, `choke` and `unchoke`
//! messages. It leaves once nothing pending or in flight is servable by its
//! peer and the peer has gone quiet.
//!
//! ## Error Handling
//!
//! A piece that fails verification is put back in the queue and this peer
//! will not be asked for it again. Any connection error puts the in-flight
//! piece back and ends the worker. Neither affects the other workers.

use crate::client::Client;
use crate::config::ExchangeConfig;
use crate::error::PeerError;
use crate::message::MessageId;
use crate::peer::{Peer, PEER_ID_SIZE};
use crate::picker::{Pick, PiecePicker};
use crate::piece::{PieceProgress, PieceResult, PieceWork, HASH_SIZE};

use crossbeam_channel::Sender;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long an idle worker waits for the queue, then for its peer, per round
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// What a worker reports back to the exchange.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A piece was downloaded and verified.
    Completed(PieceResult),
    /// A piece failed verification and went back to the queue.
    Rejected { peer: Peer, index: u32 },
    /// The worker stopped. `error` is set when the peer session failed.
    Exited {
        peer: Peer,
        error: Option<PeerError>,
    },
}

/// Downloads pieces from a single peer.
pub struct Worker {
    /// Address of the remote peer
    peer: Peer,
    /// 20-byte unique identifier for this client instance
    peer_id: [u8; PEER_ID_SIZE],
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    info_hash: [u8; HASH_SIZE],
    config: ExchangeConfig,
    /// Pieces waiting for, or held by, a worker
    picker: Arc<PiecePicker>,
    /// Reports to the exchange
    events: Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(
        peer: Peer,
        peer_id: [u8; PEER_ID_SIZE],
        info_hash: [u8; HASH_SIZE],
        config: ExchangeConfig,
        picker: Arc<PiecePicker>,
        events: Sender<WorkerEvent>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            info_hash,
            config,
            picker,
            events,
        }
    }

    /// Runs the worker until the peer fails, has nothing left to offer, or
    /// the download ends. Always reports [`WorkerEvent::Exited`].
    pub fn run(self) {
        let error = self.start_download().err();

        match &error {
            Some(e) => debug!("Worker for peer {} exiting: {}", self.peer, e),
            None => debug!("Worker for peer {} exiting", self.peer),
        }

        let event = WorkerEvent::Exited {
            peer: self.peer,
            error,
        };
        if self.events.send(event).is_err() {
            debug!("Exchange already finished");
        }
    }

    fn start_download(&self) -> Result<(), PeerError> {
        if self.picker.is_closed() {
            return Err(PeerError::Cancelled);
        }

        debug!("Attempting to connect to peer {}", self.peer);
        let mut client = Client::connect(self.peer, &self.peer_id, &self.info_hash, &self.config)?;
        debug!(
            "Peer {} identified as {}",
            self.peer,
            hex::encode(client.remote_id())
        );

        let result = self.exchange_pieces(&mut client);
        client.shutdown();
        result
    }

    fn exchange_pieces(&self, client: &mut Client) -> Result<(), PeerError> {
        client.send_unchoke()?;
        client.send_interested()?;

        // Pieces this peer sent corrupted data for
        let mut distrusted: HashSet<u32> = HashSet::new();

        while let Some(piece_work) = self.next_work(client, &distrusted)? {
            let index = piece_work.index;
            let data = match self.download_piece(client, &piece_work) {
                Ok(data) => data,
                Err(e) => {
                    self.picker.release(piece_work);
                    return Err(e);
                }
            };

            if !piece_work.verify(&data) {
                warn!(
                    "{} from peer {}, putting it back in the queue",
                    PeerError::Integrity { index },
                    self.peer
                );
                distrusted.insert(index);
                self.picker.release(piece_work);

                let event = WorkerEvent::Rejected {
                    peer: self.peer,
                    index,
                };
                if self.events.send(event).is_err() {
                    return Ok(());
                }
                continue;
            }

            info!("Successfully verified integrity of piece {}", index);
            self.picker.complete(index);

            if let Err(e) = client.send_have(index) {
                warn!("Could not notify peer {} of piece {}: {}", self.peer, index, e);
            }

            if self
                .events
                .send(WorkerEvent::Completed(PieceResult::new(index, data)))
                .is_err()
            {
                error!("Error: could not send piece to channel");
                return Ok(());
            }
        }

        Ok(())
    }

    /// Takes the next piece this peer can serve.
    ///
    /// Returns `None` when the download ended, or when no pending or in-flight
    /// piece is servable by this peer and it has nothing more to say.
    fn next_work(
        &self,
        client: &mut Client,
        distrusted: &HashSet<u32>,
    ) -> Result<Option<PieceWork>, PeerError> {
        loop {
            let pick = self.picker.pick(
                |index| client.has_piece(index) && !distrusted.contains(&index),
                IDLE_WAIT,
            );

            match pick {
                Pick::Piece(piece_work) => return Ok(Some(piece_work)),
                Pick::Closed => return Ok(None),
                Pick::Idle => {
                    self.listen(client)?;
                }
                Pick::Exhausted => {
                    // A HAVE may still be on its way
                    if !self.listen(client)? {
                        info!("Peer {} has no pending piece to offer", self.peer);
                        if let Err(e) = client.send_not_interested() {
                            warn!("Could not notify peer {} before leaving: {}", self.peer, e);
                        }
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Handles at most one message from a peer we are not downloading from.
    /// Returns whether the peer sent anything.
    fn listen(&self, client: &mut Client) -> Result<bool, PeerError> {
        let message = match client.poll_message(IDLE_WAIT, self.config.piece_timeout)? {
            Some(message) => message,
            None => return Ok(false),
        };

        match message.id {
            MessageId::Choke => client.read_choke(),
            MessageId::Unchoke => client.read_unchoke(),
            MessageId::Have => client.read_have(&message)?,
            _ => info!("Ignore {} from peer {}", message, self.peer),
        }

        Ok(true)
    }

    /// Downloads one piece within the per-piece timeout.
    ///
    /// The connection deadline is cleared before returning so the next piece
    /// starts with a fresh budget.
    fn download_piece(
        &self,
        client: &mut Client,
        piece_work: &PieceWork,
    ) -> Result<Vec<u8>, PeerError> {
        let deadline = Instant::now() + self.config.piece_timeout;

        client.set_deadline(Some(self.config.piece_timeout))?;
        let result = self.request_blocks(client, piece_work, deadline);
        let cleared = client.set_deadline(None);

        let data = result?;
        cleared?;

        info!(
            "Successfully downloaded piece {} from peer {}",
            piece_work.index, self.peer
        );

        Ok(data)
    }

    fn request_blocks(
        &self,
        client: &mut Client,
        piece_work: &PieceWork,
        deadline: Instant,
    ) -> Result<Vec<u8>, PeerError> {
        let mut progress = PieceProgress::new(piece_work, self.config.block_size);

        if client.is_choked() {
            client.ensure_interested()?;
        }

        while !progress.is_complete() {
            if self.picker.is_closed() {
                return Err(PeerError::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PeerError::Timeout(self.config.piece_timeout));
            }
            client.set_deadline(Some(deadline - now))?;

            if !client.is_choked() {
                while progress.backlog < self.config.backlog {
                    match progress.next_block() {
                        Some((begin, size)) => client.send_request(piece_work.index, begin, size)?,
                        None => break,
                    }
                }
            }

            let message = match client.read_message()? {
                Some(message) => message,
                None => {
                    info!("Receive KEEP_ALIVE from peer {}", self.peer);
                    continue;
                }
            };

            match message.id {
                MessageId::Choke => {
                    client.read_choke();
                    progress.reset_requests();
                    warn!("Peer {} choked us, waiting for unchoke...", self.peer);
                }
                MessageId::Unchoke => client.read_unchoke(),
                MessageId::Have => client.read_have(&message)?,
                MessageId::Piece => client.read_piece(&message, &mut progress)?,
                _ => info!("Ignore {} from peer {}", message, self.peer),
            }
        }

        Ok(progress.into_data())
    }
}
