//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types and serialization for the BitTorrent
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
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Description |
//! |----|------|-------------|
//! | 0 | CHOKE | Peer will not send pieces (no payload) |
//! | 1 | UNCHOKE | Peer will send pieces (no payload) |
//! | 2 | INTERESTED | Client wants to download (no payload) |
//! | 3 | NOT INTERESTED | Client doesn't want to download (no payload) |
//! | 4 | HAVE | Peer has a piece (payload: piece index) |
//! | 5 | BITFIELD | Peer's piece availability (payload: bitfield) |
//! | 6 | REQUEST | Request a block (payload: index, begin, length) |
//! | 7 | PIECE | Block data (payload: index, begin, data) |
//! | 8 | CANCEL | Cancel a request (payload: index, begin, length) |
//!
//! ## Keep-Alive Messages
//!
//! A keep-alive message has length 0 and no ID or payload. It's sent
//! periodically to prevent connection timeouts and decodes to the sentinel
//! id [`MESSAGE_KEEPALIVE`].

use crate::error::{Error, Result};

use byteorder::{BigEndian, ReadBytesExt};

use std::io::{Cursor, Read};

type MessageId = u8;
type MessagePayload = Vec<u8>;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
#[allow(dead_code)]
pub const MESSAGE_CANCEL: MessageId = 8;
pub const MESSAGE_KEEPALIVE: MessageId = 255; // Special value for keep-alive (length 0)

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message without a payload.
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize a message into its wire frame.
    ///
    /// A keep-alive serializes to the bare zero-length prefix `[0, 0, 0, 0]`.
    pub fn serialize(&self) -> Vec<u8> {
        if self.id == MESSAGE_KEEPALIVE {
            return vec![0; 4];
        }

        // Get message length
        let message_len = 1 + self.payload.len();

        let mut serialized = Vec::with_capacity(4 + message_len);

        // Add message length
        serialized.extend_from_slice(&(message_len as u32).to_be_bytes());

        // Add message id
        serialized.push(self.id);

        // Add message payload
        serialized.extend_from_slice(&self.payload);

        serialized
    }
}

/// Compute the largest message frame a connection should accept.
///
/// A PIECE message carries at most one block plus 8 bytes of header, but a
/// peer may legally batch up to a full piece. Anything larger than a piece
/// plus one oversized block is rejected as a protocol violation.
pub fn frame_limit(piece_length: u32) -> usize {
    piece_length as usize + 64 * 1024 + 13
}

/// Read and decode one message from a stream.
///
/// Blocks until a full frame arrives. A zero length prefix decodes to the
/// keep-alive sentinel. Short reads surface as transport errors, a length
/// prefix above `max_len` as a protocol violation.
pub fn read<R: Read>(reader: &mut R, max_len: usize) -> Result<Message> {
    // Read message length
    let mut len_buf = [0; 4];
    reader.read_exact(&mut len_buf).map_err(Error::Transport)?;

    let mut len_cursor = Cursor::new(len_buf);
    let message_len = len_cursor
        .read_u32::<BigEndian>()
        .map_err(Error::Transport)? as usize;

    // A zero length is a keep-alive
    if message_len == 0 {
        return Ok(Message::new(MESSAGE_KEEPALIVE));
    }

    if message_len > max_len {
        return Err(Error::Protocol(format!(
            "message of {message_len} bytes exceeds the {max_len} byte frame limit"
        )));
    }

    // Read message id and payload
    let mut message_buf = vec![0; message_len];
    reader
        .read_exact(&mut message_buf)
        .map_err(Error::Transport)?;

    Ok(Message {
        id: message_buf[0],
        payload: message_buf[1..].to_vec(),
    })
}

/// Build a REQUEST message for one block.
pub fn format_request(index: u32, begin: u32, length: u32) -> Message {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());

    Message::new_with_payload(MESSAGE_REQUEST, payload)
}

/// Build a PIECE message carrying one block.
pub fn format_piece(index: u32, begin: u32, block: &[u8]) -> Message {
    let mut payload = Vec::with_capacity(8 + block.len());
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(block);

    Message::new_with_payload(MESSAGE_PIECE, payload)
}

/// Validate a PIECE message and copy its block into a piece buffer.
///
/// Returns the number of bytes copied.
pub fn parse_piece(expected_index: u32, buf: &mut [u8], message: &Message) -> Result<usize> {
    if message.id != MESSAGE_PIECE {
        return Err(Error::Protocol(format!(
            "expected MESSAGE_PIECE (id {MESSAGE_PIECE}), got id {}",
            message.id
        )));
    }
    if message.payload.len() < 8 {
        return Err(Error::Protocol(format!(
            "MESSAGE_PIECE payload of {} bytes is too short",
            message.payload.len()
        )));
    }

    // Get piece index
    let mut payload_cursor = Cursor::new(&message.payload[0..8]);
    let index = payload_cursor
        .read_u32::<BigEndian>()
        .map_err(Error::Transport)?;
    if index != expected_index {
        return Err(Error::Protocol(format!(
            "expected block of piece {expected_index}, got piece {index}"
        )));
    }

    // Get byte offset within piece
    let begin = payload_cursor
        .read_u32::<BigEndian>()
        .map_err(Error::Transport)? as usize;

    // Get piece block
    let block = &message.payload[8..];
    if begin + block.len() > buf.len() {
        return Err(Error::Protocol(format!(
            "block [{begin}:{}] overflows the {} byte piece buffer",
            begin + block.len(),
            buf.len()
        )));
    }

    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len())
}

/// Block requested by a remote peer, resolved to an absolute byte range.
#[derive(Debug, PartialEq, Eq)]
pub struct BlockRequest {
    /// Piece index
    pub index: u32,
    /// Offset of the block within the piece
    pub block_begin: u32,
    /// Absolute offset of the block in the content
    pub begin: u64,
    /// Block length, clamped to the end of the content
    pub length: u32,
}

/// Validate a REQUEST message against the torrent geometry.
///
/// The requested range is resolved to absolute content offsets and its end is
/// clamped to the total content length, so the trailing block of the last
/// piece comes out short.
pub fn parse_request(message: &Message, piece_length: u32, total_length: u32) -> Result<BlockRequest> {
    if message.id != MESSAGE_REQUEST {
        return Err(Error::Protocol(format!(
            "expected MESSAGE_REQUEST (id {MESSAGE_REQUEST}), got id {}",
            message.id
        )));
    }
    if message.payload.len() < 12 {
        return Err(Error::Protocol(format!(
            "MESSAGE_REQUEST payload of {} bytes is too short",
            message.payload.len()
        )));
    }

    let mut payload_cursor = Cursor::new(&message.payload[0..12]);
    let index = payload_cursor
        .read_u32::<BigEndian>()
        .map_err(Error::Transport)?;
    let block_begin = payload_cursor
        .read_u32::<BigEndian>()
        .map_err(Error::Transport)?;
    let block_len = payload_cursor
        .read_u32::<BigEndian>()
        .map_err(Error::Transport)?;

    // Resolve the absolute byte range of the block
    let begin = u64::from(index) * u64::from(piece_length) + u64::from(block_begin);
    if begin >= u64::from(total_length) {
        return Err(Error::Protocol(format!(
            "requested range starts at {begin}, past the {total_length} byte content"
        )));
    }

    let end = (begin + u64::from(block_len)).min(u64::from(total_length));

    Ok(BlockRequest {
        index,
        block_begin,
        begin,
        length: (end - begin) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_then_read_round_trips() {
        let payloads: Vec<Vec<u8>> = vec![vec![], vec![1, 2, 3], vec![0xab; 1024 * 1024]];

        for id in MESSAGE_CHOKE..=MESSAGE_CANCEL {
            for payload in &payloads {
                let message = Message::new_with_payload(id, payload.clone());
                let mut cursor = Cursor::new(message.serialize());
                let decoded = read(&mut cursor, 2 * 1024 * 1024).unwrap();
                assert_eq!(decoded, message);
            }
        }
    }

    #[test]
    fn keep_alive_round_trips() {
        assert_eq!(Message::new(MESSAGE_KEEPALIVE).serialize(), vec![0; 4]);

        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        let decoded = read(&mut cursor, 16).unwrap();
        assert_eq!(decoded.id, MESSAGE_KEEPALIVE);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn read_rejects_oversized_frames() {
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0; 64]);
        let mut cursor = Cursor::new(message.serialize());
        assert!(matches!(read(&mut cursor, 32), Err(Error::Protocol(_))));
    }

    #[test]
    fn read_surfaces_short_reads_as_transport_errors() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 5, 7]);
        assert!(matches!(
            read(&mut cursor, 1024),
            Err(Error::Transport(_))
        ));
    }

    #[test]
    fn format_request_packs_big_endian_fields() {
        let message = format_request(1, 16384, 1000);
        assert_eq!(message.id, MESSAGE_REQUEST);
        assert_eq!(
            message.payload,
            vec![0, 0, 0, 1, 0, 0, 0x40, 0, 0, 0, 0x03, 0xe8]
        );
    }

    #[test]
    fn parse_piece_copies_block_at_offset() {
        let mut buf = vec![0; 10];
        let message = format_piece(4, 6, b"cafe");

        let n = parse_piece(4, &mut buf, &message).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[6..], b"cafe");
        assert_eq!(&buf[..6], &[0; 6]);
    }

    #[test]
    fn parse_piece_rejects_invalid_messages() {
        let mut buf = vec![0; 10];

        // Wrong id
        let message = Message::new_with_payload(MESSAGE_HAVE, vec![0; 12]);
        assert!(parse_piece(0, &mut buf, &message).is_err());

        // Payload too short to carry a header
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0; 7]);
        assert!(parse_piece(0, &mut buf, &message).is_err());

        // Block for another piece
        let message = format_piece(3, 0, b"data");
        assert!(parse_piece(0, &mut buf, &message).is_err());

        // Block overflowing the piece buffer
        let message = format_piece(0, 8, b"data");
        assert!(parse_piece(0, &mut buf, &message).is_err());
    }

    #[test]
    fn parse_request_resolves_absolute_range() {
        let message = format_request(2, 100, 50);
        let request = parse_request(&message, 1000, 10000).unwrap();

        assert_eq!(request.index, 2);
        assert_eq!(request.block_begin, 100);
        assert_eq!(request.begin, 2100);
        assert_eq!(request.length, 50);
    }

    #[test]
    fn parse_request_clamps_to_content_end() {
        // Two pieces of 4 bytes over 7 bytes of content
        let message = format_request(1, 0, 4);
        let request = parse_request(&message, 4, 7).unwrap();

        assert_eq!(request.begin, 4);
        assert_eq!(request.length, 3);
    }

    #[test]
    fn parse_request_rejects_invalid_messages() {
        // Wrong id
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0; 12]);
        assert!(parse_request(&message, 4, 7).is_err());

        // Payload too short
        let message = Message::new_with_payload(MESSAGE_REQUEST, vec![0; 11]);
        assert!(parse_request(&message, 4, 7).is_err());

        // Range entirely past the content
        let message = format_request(7, 0, 4);
        assert!(parse_request(&message, 4, 7).is_err());
    }
}
