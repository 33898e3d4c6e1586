//! # Peer Bitfield
//!
//! Compact record of which pieces a peer has announced.
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]
//! Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
//! ```
//!
//! Bit 7 (MSB) of byte 0 is piece 0. Indices past the end of the buffer are
//! treated as absent, and the buffer never grows.

use std::net::TcpStream;
use std::time::Duration;

use crate::client::set_deadline;
use crate::error::PeerError;
use crate::message::{self, MessageId};

/// Pieces advertised by one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    /// Number of bytes backing the bitfield.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Checks if the peer has a piece. Out-of-range indices return `false`.
    pub fn has_piece(&self, index: usize) -> bool {
        let byte_index = index / 8;
        let offset = index % 8;

        match self.0.get(byte_index) {
            Some(&byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Marks a piece as available. Out-of-range indices are ignored.
    pub fn set_piece(&mut self, index: usize) {
        let byte_index = index / 8;
        let offset = index % 8;

        if let Some(byte) = self.0.get_mut(byte_index) {
            *byte |= 1u8 << (7 - offset);
        }
    }

    /// Reads the BITFIELD message a peer sends right after the handshake.
    ///
    /// The read deadline only applies to this call and is cleared before
    /// returning.
    pub fn receive_from(conn: &mut TcpStream, timeout: Duration) -> Result<Bitfield, PeerError> {
        set_deadline(conn, Some(timeout))?;
        let result = message::read(conn);
        let cleared = set_deadline(conn, None);

        let message = result.map_err(|e| PeerError::from_read(e, timeout))?;
        cleared?;

        match message {
            Some(message) if message.id == MessageId::Bitfield => {
                Ok(Bitfield::from(message.payload))
            }
            Some(message) => Err(PeerError::Protocol(format!(
                "expected bitfield but got {}",
                message
            ))),
            None => Err(PeerError::Protocol(
                "expected bitfield but got keep-alive".to_string(),
            )),
        }
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bytes: Vec<u8>) -> Self {
        Bitfield(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn has_piece() {
        let bitfield = Bitfield::from(vec![0b0101_0100, 0b0101_0100]);
        let expected = [
            false, true, false, true, false, true, false, false, false, true, false, true, false,
            true, false, false,
        ];
        for (i, want) in expected.iter().enumerate() {
            assert_eq!(bitfield.has_piece(i), *want, "piece {}", i);
        }
        assert!(!bitfield.has_piece(16));
        assert!(!bitfield.has_piece(usize::MAX));
    }

    #[test]
    fn set_piece() {
        let mut bitfield = Bitfield::from(vec![0b0101_0100, 0b0101_0100]);
        bitfield.set_piece(4);
        bitfield.set_piece(9);
        bitfield.set_piece(15);
        assert_eq!(bitfield.as_bytes(), &[0b0101_1100, 0b0101_0101]);

        bitfield.set_piece(4);
        assert_eq!(bitfield.as_bytes(), &[0b0101_1100, 0b0101_0101]);
    }

    #[test]
    fn set_piece_out_of_range_is_ignored() {
        let mut bitfield = Bitfield::from(vec![0, 0]);
        bitfield.set_piece(16);
        bitfield.set_piece(1000);
        assert_eq!(bitfield.as_bytes(), &[0, 0]);
        assert!(!bitfield.has_piece(16));

        bitfield.set_piece(3);
        assert!(bitfield.has_piece(3));
        assert!(!bitfield.has_piece(1000));
    }

    fn receive_after(bytes: Vec<u8>) -> (Result<Bitfield, PeerError>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&bytes).unwrap();
            conn
        });

        let mut conn = TcpStream::connect(addr).unwrap();
        let result = Bitfield::receive_from(&mut conn, Duration::from_secs(5));
        drop(server.join().unwrap());
        (result, conn)
    }

    #[test]
    fn receive_bitfield() {
        let (result, conn) = receive_after(Message::bitfield(&[0xf0]).serialize());
        let bitfield = result.unwrap();
        assert!(bitfield.has_piece(3));
        assert!(!bitfield.has_piece(4));
        assert_eq!(conn.read_timeout().unwrap(), None);
    }

    #[test]
    fn receive_keep_alive_fails() {
        let (result, _) = receive_after(vec![0, 0, 0, 0]);
        assert!(matches!(result, Err(PeerError::Protocol(_))));
    }

    #[test]
    fn receive_other_kind_fails() {
        let (result, _) = receive_after(Message::have(1).serialize());
        assert!(matches!(result, Err(PeerError::Protocol(_))));
    }
}
