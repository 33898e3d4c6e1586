//! # BitTorrent Peer Client
//!
//! This module implements the client side of the peer wire protocol for one
//! remote peer: connection setup, choke tracking, the peer's bitfield, and
//! the send/receive helpers the download worker is built on.
//!
//! ## Connection Setup
//!
//! 1. **Dial**: TCP connect with a short timeout
//! 2. **Handshake**: protocol negotiation and info hash check
//! 3. **Bitfield**: the peer's piece availability, expected right after the handshake
//!
//! A [`Client`] only exists once all three steps have succeeded. It starts
//! choked and not interested.
//!
//! ## Deadlines
//!
//! Every setup phase sets its own read/write deadline and clears it before
//! the next phase, so a slow phase never leaves a stale timeout on the socket.

use crate::bitfield::Bitfield;
use crate::config::ExchangeConfig;
use crate::error::{MessageError, PeerError};
use crate::handshake::{self, Handshake};
use crate::message::{self, Message, MessageId};
use crate::peer::{Peer, PEER_ID_SIZE};
use crate::piece::{PieceProgress, HASH_SIZE};

use byteorder::{BigEndian, ByteOrder};

use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Sets (or clears, with `None`) the read and write timeouts of a connection.
pub(crate) fn set_deadline(conn: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    conn.set_write_timeout(timeout)?;
    conn.set_read_timeout(timeout)
}

/// A live, authenticated connection to a remote peer.
pub struct Client {
    /// Address of the remote peer
    peer: Peer,
    /// Handshake the remote peer answered with
    remote: Handshake,
    /// TCP stream connection to the peer
    conn: TcpStream,
    /// Pieces the peer has announced
    bitfield: Bitfield,
    /// Whether the peer has choked this client (preventing downloads)
    choked: bool,
    /// Whether we told the peer we want to download from it
    interested: bool,
}

impl Client {
    /// Dials a peer, completes the handshake and receives its bitfield.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot be reached, answers with a bad
    /// handshake, or does not send a bitfield in time. The socket is closed on
    /// every error path since it is dropped before returning.
    pub fn connect(
        peer: Peer,
        peer_id: &[u8; PEER_ID_SIZE],
        info_hash: &[u8; HASH_SIZE],
        config: &ExchangeConfig,
    ) -> Result<Client, PeerError> {
        let mut conn = TcpStream::connect_timeout(&peer.socket_addr(), config.connect_timeout)
            .map_err(PeerError::Connect)?;

        debug!("Connected to peer {}", peer);

        let remote = handshake::complete(&mut conn, info_hash, peer_id, config.handshake_timeout)?;

        debug!("Completed handshake with peer {}", peer);

        let bitfield = Bitfield::receive_from(&mut conn, config.bitfield_timeout)?;

        info!("Receive MESSAGE_BITFIELD from peer {}", peer);

        Ok(Client {
            peer,
            remote,
            conn,
            bitfield,
            choked: true,
            interested: false,
        })
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    /// Peer id the remote side declared in its handshake.
    pub fn remote_id(&self) -> &[u8; PEER_ID_SIZE] {
        &self.remote.peer_id
    }

    /// Returns whether this client is choked by the peer.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Checks if the peer has announced a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index as usize)
    }

    /// Sets read and write timeouts on the connection. `None` clears them.
    pub fn set_deadline(&self, timeout: Option<Duration>) -> Result<(), PeerError> {
        set_deadline(&self.conn, timeout)?;
        Ok(())
    }

    /// Reads one message. Returns `Ok(None)` on keep-alive.
    pub fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        match message::read(&mut self.conn) {
            Ok(message) => Ok(message),
            Err(e) => {
                let timeout = self.conn.read_timeout().ok().flatten().unwrap_or_default();
                Err(PeerError::from_read(e, timeout))
            }
        }
    }

    /// Waits up to `wait` for the peer to start a message, then reads it within
    /// `timeout`. Returns `Ok(None)` if the peer stayed quiet or sent a
    /// keep-alive. The connection deadline is cleared before returning.
    ///
    /// `wait` must not be zero.
    pub fn poll_message(
        &mut self,
        wait: Duration,
        timeout: Duration,
    ) -> Result<Option<Message>, PeerError> {
        self.conn.set_read_timeout(Some(wait))?;

        let mut first = [0; 1];
        let ready = match self.conn.peek(&mut first) {
            Ok(0) => {
                return Err(PeerError::Io(io::Error::from(
                    io::ErrorKind::UnexpectedEof,
                )))
            }
            Ok(_) => true,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                false
            }
            Err(e) => return Err(e.into()),
        };

        if !ready {
            self.set_deadline(None)?;
            return Ok(None);
        }

        self.set_deadline(Some(timeout))?;
        let message = self.read_message();
        let cleared = self.set_deadline(None);

        let message = message?;
        cleared?;
        Ok(message)
    }

    fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.conn.write_all(&message.serialize())?;
        Ok(())
    }

    /// Processes a CHOKE message from the peer.
    pub fn read_choke(&mut self) {
        info!("Receive MESSAGE_CHOKE from peer {}", self.peer);
        self.choked = true
    }

    /// Processes an UNCHOKE message from the peer.
    pub fn read_unchoke(&mut self) {
        info!("Receive MESSAGE_UNCHOKE from peer {}", self.peer);
        self.choked = false
    }

    /// Processes a HAVE message and records the piece in the peer's bitfield.
    pub fn read_have(&mut self, message: &Message) -> Result<(), PeerError> {
        let index = message::parse_have(message)?;

        info!("Receive MESSAGE_HAVE {} from peer {}", index, self.peer);

        self.bitfield.set_piece(index as usize);
        Ok(())
    }

    /// Processes a PIECE message and copies its block into the piece buffer.
    ///
    /// Blocks of another piece, blocks already received, and blocks not on a
    /// block boundary are ignored.
    pub fn read_piece(
        &mut self,
        message: &Message,
        progress: &mut PieceProgress,
    ) -> Result<(), PeerError> {
        let n = match message::parse_piece(progress.index, &mut progress.buf, message) {
            Ok(n) => n,
            // Late answer to a request for a piece already finished
            Err(MessageError::IndexMismatch { actual, .. }) => {
                debug!("Ignore block of piece {} from peer {}", actual, self.peer);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        // parse_piece checked the 8-byte header
        let begin = BigEndian::read_u32(&message.payload[4..8]);

        if progress.record_block(begin, n) {
            debug!(
                "Receive {} bytes of piece {} at {} from peer {}",
                n, progress.index, begin, self.peer
            );
        } else {
            debug!(
                "Ignore unexpected block of piece {} at {} from peer {}",
                progress.index, begin, self.peer
            );
        }

        Ok(())
    }

    /// Sends an UNCHOKE message to the peer.
    pub fn send_unchoke(&mut self) -> Result<(), PeerError> {
        info!("Send MESSAGE_UNCHOKE to peer {}", self.peer);
        self.send(&Message::new(MessageId::Unchoke))
    }

    /// Sends an INTERESTED message to the peer.
    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        info!("Send MESSAGE_INTERESTED to peer {}", self.peer);
        self.send(&Message::new(MessageId::Interested))?;
        self.interested = true;
        Ok(())
    }

    /// Sends INTERESTED unless it was already sent on this connection.
    pub fn ensure_interested(&mut self) -> Result<(), PeerError> {
        if self.interested {
            return Ok(());
        }
        self.send_interested()
    }

    /// Sends a NOT INTERESTED message, typically before leaving a peer.
    pub fn send_not_interested(&mut self) -> Result<(), PeerError> {
        info!("Send MESSAGE_NOT_INTERESTED to peer {}", self.peer);
        self.send(&Message::new(MessageId::NotInterested))?;
        self.interested = false;
        Ok(())
    }

    /// Sends a HAVE message to notify the peer that we now have a piece.
    pub fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        info!("Send MESSAGE_HAVE {} to peer {}", index, self.peer);
        self.send(&Message::have(index))
    }

    /// Sends a REQUEST message for one block.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        info!(
            "Send MESSAGE_REQUEST for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send(&Message::request(index, begin, length))
    }

    /// Closes both halves of the connection.
    pub fn shutdown(&self) {
        if let Err(e) = self.conn.shutdown(Shutdown::Both) {
            debug!("Error shutting down connection to {}: {}", self.peer, e);
        }
    }
}
