//! # Error Types
//!
//! Typed errors for the peer wire protocol engine.
//!
//! - [`MessageError`]: framing and payload validation failures
//! - [`HandshakeError`]: malformed or mismatched handshakes
//! - [`PeerError`]: anything that ends a single peer session
//! - [`ExchangeError`]: fatal errors surfaced to the caller of the exchange
//!
//! Only [`ExchangeError`] ever reaches the caller. Every other error is local to
//! the worker that hit it and results in the in-flight piece being requeued.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::message::MessageId;

/// Errors raised while reading or decoding peer wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The stream closed before the declared number of bytes arrived.
    #[error("truncated read: {0}")]
    TruncatedRead(#[source] io::Error),

    #[error("invalid message kind: expected {expected:?}, got {actual:?}")]
    InvalidMessageKind {
        expected: MessageId,
        actual: MessageId,
    },

    #[error("payload too short: {len} < {min}")]
    PayloadTooShort { len: usize, min: usize },

    #[error("bad payload length: {len} != {expected}")]
    BadPayloadLength { len: usize, expected: usize },

    #[error("index mismatch: expected {expected}, got {actual}")]
    IndexMismatch { expected: u32, actual: u32 },

    #[error("begin offset out of range: {begin} >= {len}")]
    OffsetOutOfRange { begin: usize, len: usize },

    #[error("data overrun: {begin} + {data_len} > {len}")]
    DataOverrun {
        begin: usize,
        data_len: usize,
        len: usize,
    },
}

/// Errors raised by the handshake exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake io error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol name length cannot be 0")]
    EmptyProtocolName,

    /// The remote peer is serving a different torrent.
    #[error("expected content hash {expected} but got {actual}")]
    ContentHashMismatch { expected: String, actual: String },
}

/// Errors that end a session with one peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("could not connect to peer: {0}")]
    Connect(#[source] io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer sent something other than what the protocol expected here.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Payload(#[from] MessageError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Downloaded data did not hash to the expected value.
    #[error("integrity check failed for piece {index}")]
    Integrity { index: u32 },

    #[error("download cancelled")]
    Cancelled,
}

impl PeerError {
    /// Maps a failed message read, reporting expired deadlines as timeouts.
    pub fn from_read(err: MessageError, timeout: Duration) -> PeerError {
        match err {
            MessageError::TruncatedRead(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                PeerError::Timeout(timeout)
            }
            err => PeerError::Payload(err),
        }
    }

    /// Whether the peer connection is still usable after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PeerError::Integrity { .. })
    }
}

/// Fatal errors returned by the piece exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pieces are still pending but every peer worker has exited.
    #[error("no peers available: {remaining} pieces still pending ({failures} peer failures)")]
    NoPeersAvailable { remaining: usize, failures: usize },

    #[error("download cancelled")]
    Cancelled,
}
