//! # BitTorrent Handshake Protocol
//!
//! This module implements the initial handshake used to establish
//! communication between BitTorrent peers.
//!
//! ## Message Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte - Length of protocol string (usually 19)
//! - **pstr**: Variable - Protocol identifier ("BitTorrent protocol")
//! - **reserved**: 8 bytes - All zeros
//! - **info_hash**: 20 bytes - SHA-1 hash of torrent info dictionary
//! - **peer_id**: 20 bytes - Unique identifier for the peer
//!
//! The remote protocol string and peer id are accepted as sent. Only the
//! info hash is checked, and this is the only place a connection is
//! authenticated.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::client::set_deadline;
use crate::error::HandshakeError;
use crate::peer::PEER_ID_SIZE;

/// Protocol identifier sent in every outgoing handshake
pub const PROTOCOL_ID: &str = "BitTorrent protocol";

const RESERVED_SIZE: usize = 8;
const INFO_HASH_SIZE: usize = 20;
const FIXED_SIZE: usize = RESERVED_SIZE + INFO_HASH_SIZE + PEER_ID_SIZE;

/// A parsed or outgoing handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier declared by the sender
    pub pstr: String,
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: [u8; INFO_HASH_SIZE],
    /// 20-byte identifier of the sender
    pub peer_id: [u8; PEER_ID_SIZE],
}

impl Handshake {
    /// Creates a handshake for the standard protocol.
    pub fn new(info_hash: [u8; INFO_HASH_SIZE], peer_id: [u8; PEER_ID_SIZE]) -> Self {
        Handshake {
            pstr: PROTOCOL_ID.to_string(),
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake. Total size is `49 + pstrlen` bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized = Vec::with_capacity(1 + self.pstr.len() + FIXED_SIZE);
        serialized.push(self.pstr.len() as u8);
        serialized.extend_from_slice(self.pstr.as_bytes());
        serialized.extend_from_slice(&[0; RESERVED_SIZE]);
        serialized.extend_from_slice(&self.info_hash);
        serialized.extend_from_slice(&self.peer_id);
        serialized
    }

    /// Reads a handshake from a stream.
    ///
    /// Reserved bytes are skipped without inspection.
    pub fn read<R: Read>(r: &mut R) -> Result<Handshake, HandshakeError> {
        let mut len_buf = [0; 1];
        r.read_exact(&mut len_buf)?;

        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(HandshakeError::EmptyProtocolName);
        }

        let mut handshake_buf = vec![0; pstrlen + FIXED_SIZE];
        r.read_exact(&mut handshake_buf)?;

        let hash_start = pstrlen + RESERVED_SIZE;
        let id_start = hash_start + INFO_HASH_SIZE;

        let mut info_hash = [0; INFO_HASH_SIZE];
        info_hash.copy_from_slice(&handshake_buf[hash_start..id_start]);
        let mut peer_id = [0; PEER_ID_SIZE];
        peer_id.copy_from_slice(&handshake_buf[id_start..]);

        Ok(Handshake {
            pstr: String::from_utf8_lossy(&handshake_buf[..pstrlen]).into_owned(),
            info_hash,
            peer_id,
        })
    }
}

/// Performs the handshake on a freshly opened connection.
///
/// The connection deadline is set to `timeout` for the exchange and always
/// cleared before returning.
///
/// # Errors
///
/// Fails with [`HandshakeError::ContentHashMismatch`] when the peer answers
/// for a different torrent.
pub fn complete(
    conn: &mut TcpStream,
    info_hash: &[u8; INFO_HASH_SIZE],
    peer_id: &[u8; PEER_ID_SIZE],
    timeout: Duration,
) -> Result<Handshake, HandshakeError> {
    set_deadline(conn, Some(timeout))?;
    let result = exchange(conn, info_hash, peer_id);
    let cleared = set_deadline(conn, None);

    let handshake = result?;
    cleared?;
    Ok(handshake)
}

fn exchange(
    conn: &mut TcpStream,
    info_hash: &[u8; INFO_HASH_SIZE],
    peer_id: &[u8; PEER_ID_SIZE],
) -> Result<Handshake, HandshakeError> {
    let request = Handshake::new(*info_hash, *peer_id);
    conn.write_all(&request.serialize())?;

    let response = Handshake::read(conn)?;
    if response.info_hash != *info_hash {
        return Err(HandshakeError::ContentHashMismatch {
            expected: hex::encode(info_hash),
            actual: hex::encode(response.info_hash),
        });
    }

    Ok(response)
}
