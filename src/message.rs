//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message kinds and framing for the BitTorrent
//! peer wire protocol. All communication between peers after the handshake
//! uses these messages.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Total length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message kind
//! - **Payload**: Variable length - Kind-specific data
//!
//! ## Message Kinds
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | bitfield bytes |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, data |
//! | 8 | CANCEL | index, begin, length |
//!
//! ## Keep-Alive Messages
//!
//! A keep-alive has length 0 and no ID or payload. It is not a message kind:
//! [`read`] returns `None` for it and [`serialize`] writes it for `None`.

use std::fmt;
use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::MessageError;

const LENGTH_PREFIX_SIZE: usize = 4;
const PIECE_HEADER_SIZE: usize = 8;
const HAVE_PAYLOAD_SIZE: usize = 4;
const REQUEST_PAYLOAD_SIZE: usize = 12;

/// Kind tag of a peer wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have,
    Bitfield,
    Request,
    Piece,
    Cancel,
    /// A tag outside the base protocol, carried through so callers can skip it.
    Unknown(u8),
}

impl From<u8> for MessageId {
    fn from(id: u8) -> Self {
        match id {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            other => MessageId::Unknown(other),
        }
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        match id {
            MessageId::Choke => 0,
            MessageId::Unchoke => 1,
            MessageId::Interested => 2,
            MessageId::NotInterested => 3,
            MessageId::Have => 4,
            MessageId::Bitfield => 5,
            MessageId::Request => 6,
            MessageId::Piece => 7,
            MessageId::Cancel => 8,
            MessageId::Unknown(other) => other,
        }
    }
}

/// A framed peer wire message: a kind tag plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message kind
    pub id: MessageId,
    /// Kind-specific payload bytes
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message without payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a message with a payload.
    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Self {
        Message { id, payload }
    }

    /// Build a HAVE message for a piece index.
    pub fn have(index: u32) -> Self {
        let mut payload = vec![0; HAVE_PAYLOAD_SIZE];
        BigEndian::write_u32(&mut payload, index);
        Message::new_with_payload(MessageId::Have, payload)
    }

    /// Build a REQUEST message for a block.
    pub fn request(index: u32, begin: u32, length: u32) -> Self {
        Message::new_with_payload(MessageId::Request, block_payload(index, begin, length))
    }

    /// Build a CANCEL message for a previously requested block.
    pub fn cancel(index: u32, begin: u32, length: u32) -> Self {
        Message::new_with_payload(MessageId::Cancel, block_payload(index, begin, length))
    }

    /// Build a PIECE message carrying block data.
    pub fn piece(index: u32, begin: u32, data: &[u8]) -> Self {
        let mut payload = vec![0; PIECE_HEADER_SIZE];
        BigEndian::write_u32(&mut payload[0..4], index);
        BigEndian::write_u32(&mut payload[4..8], begin);
        payload.extend_from_slice(data);
        Message::new_with_payload(MessageId::Piece, payload)
    }

    /// Build a BITFIELD message from raw bitfield bytes.
    pub fn bitfield(bytes: &[u8]) -> Self {
        Message::new_with_payload(MessageId::Bitfield, bytes.to_vec())
    }

    /// Serialize message as `<length><id><payload>`.
    pub fn serialize(&self) -> Vec<u8> {
        let message_len = 1 + self.payload.len();

        let mut serialized = vec![0; LENGTH_PREFIX_SIZE];
        BigEndian::write_u32(&mut serialized, message_len as u32);
        serialized.push(self.id.into());
        serialized.extend_from_slice(&self.payload);

        serialized
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            MessageId::Choke => write!(f, "CHOKE"),
            MessageId::Unchoke => write!(f, "UNCHOKE"),
            MessageId::Interested => write!(f, "INTERESTED"),
            MessageId::NotInterested => write!(f, "NOT_INTERESTED"),
            MessageId::Have => write!(f, "HAVE"),
            MessageId::Bitfield => write!(f, "BITFIELD [{}]", self.payload.len()),
            MessageId::Request => write!(f, "REQUEST"),
            MessageId::Piece => write!(f, "PIECE [{}]", self.payload.len()),
            MessageId::Cancel => write!(f, "CANCEL"),
            MessageId::Unknown(id) => write!(f, "UNKNOWN({})", id),
        }
    }
}

fn block_payload(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = vec![0; REQUEST_PAYLOAD_SIZE];
    BigEndian::write_u32(&mut payload[0..4], index);
    BigEndian::write_u32(&mut payload[4..8], begin);
    BigEndian::write_u32(&mut payload[8..12], length);
    payload
}

/// Serialize an optional message. `None` is a keep-alive (four zero bytes).
pub fn serialize(message: Option<&Message>) -> Vec<u8> {
    match message {
        Some(message) => message.serialize(),
        None => vec![0; LENGTH_PREFIX_SIZE],
    }
}

/// Read one message from a stream. Returns `Ok(None)` on keep-alive.
///
/// The body is read incrementally, so a peer announcing a huge length without
/// sending the bytes cannot force a large allocation up front.
pub fn read<R: Read>(r: &mut R) -> Result<Option<Message>, MessageError> {
    let message_len = r
        .read_u32::<BigEndian>()
        .map_err(MessageError::TruncatedRead)?;

    if message_len == 0 {
        return Ok(None);
    }

    let mut message_buf = Vec::new();
    r.take(message_len as u64)
        .read_to_end(&mut message_buf)
        .map_err(MessageError::TruncatedRead)?;

    if message_buf.len() < message_len as usize {
        return Err(MessageError::TruncatedRead(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "message body: got {} of {} bytes",
                message_buf.len(),
                message_len
            ),
        )));
    }

    let payload = message_buf.split_off(1);
    Ok(Some(Message::new_with_payload(message_buf[0].into(), payload)))
}

fn expect_kind(expected: MessageId, message: &Message) -> Result<(), MessageError> {
    if message.id != expected {
        return Err(MessageError::InvalidMessageKind {
            expected,
            actual: message.id,
        });
    }
    Ok(())
}

/// Parse a PIECE message and copy its block into `buf`.
///
/// Returns the number of bytes copied.
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<usize, MessageError> {
    expect_kind(MessageId::Piece, message)?;

    let payload = &message.payload;
    if payload.len() < PIECE_HEADER_SIZE {
        return Err(MessageError::PayloadTooShort {
            len: payload.len(),
            min: PIECE_HEADER_SIZE,
        });
    }

    let parsed_index = BigEndian::read_u32(&payload[0..4]);
    if parsed_index != index {
        return Err(MessageError::IndexMismatch {
            expected: index,
            actual: parsed_index,
        });
    }

    let begin = BigEndian::read_u32(&payload[4..8]) as usize;
    if begin >= buf.len() {
        return Err(MessageError::OffsetOutOfRange {
            begin,
            len: buf.len(),
        });
    }

    let data = &payload[PIECE_HEADER_SIZE..];
    if begin + data.len() > buf.len() {
        return Err(MessageError::DataOverrun {
            begin,
            data_len: data.len(),
            len: buf.len(),
        });
    }

    buf[begin..begin + data.len()].copy_from_slice(data);
    Ok(data.len())
}

/// Parse a HAVE message into its piece index.
pub fn parse_have(message: &Message) -> Result<u32, MessageError> {
    expect_kind(MessageId::Have, message)?;

    if message.payload.len() != HAVE_PAYLOAD_SIZE {
        return Err(MessageError::BadPayloadLength {
            len: message.payload.len(),
            expected: HAVE_PAYLOAD_SIZE,
        });
    }

    Ok(BigEndian::read_u32(&message.payload))
}

/// Parse a REQUEST or CANCEL message into `(index, begin, length)`.
pub fn parse_request(message: &Message) -> Result<(u32, u32, u32), MessageError> {
    if message.id != MessageId::Cancel {
        expect_kind(MessageId::Request, message)?;
    }

    let payload = &message.payload;
    if payload.len() != REQUEST_PAYLOAD_SIZE {
        return Err(MessageError::BadPayloadLength {
            len: payload.len(),
            expected: REQUEST_PAYLOAD_SIZE,
        });
    }

    Ok((
        BigEndian::read_u32(&payload[0..4]),
        BigEndian::read_u32(&payload[4..8]),
        BigEndian::read_u32(&payload[8..12]),
    ))
}
