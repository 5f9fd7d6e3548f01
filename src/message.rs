//! # BitTorrent Peer Wire Messages
//!
//! This module defines the message types, framing and typed payload
//! codecs for the BitTorrent peer wire protocol. All communication after
//! the handshake uses these messages.
//!
//! ## Message Structure
//!
//! Every message follows the same format:
//!
//! ```text
//! <length prefix><message ID><payload>
//! ```
//!
//! - **Length Prefix**: 4 bytes (big-endian u32) - Length of message ID + payload
//! - **Message ID**: 1 byte - Identifies the message type
//! - **Payload**: Variable length - Message-specific data
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | empty |
//! | 1 | UNCHOKE | empty |
//! | 2 | INTERESTED | empty |
//! | 3 | NOT INTERESTED | empty |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | packed piece availability |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//!
//! A keep-alive is a bare zero length prefix with no ID and no payload,
//! sent periodically to hold idle connections open.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

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
// Sentinel for keep-alive frames, which carry no id on the wire
pub const MESSAGE_KEEPALIVE: MessageId = 255;

#[derive(Default, Debug)]
pub struct Message {
    /// Message type identifier
    pub id: MessageId,
    /// Message payload data
    pub payload: MessagePayload,
}

impl Message {
    /// Build a new message.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    ///
    pub fn new(id: MessageId) -> Self {
        Message {
            id,
            payload: vec![],
        }
    }

    /// Build a new message with a payload.
    ///
    /// # Arguments
    ///
    /// * `id` - The type of the message.
    /// * `payload` - The content of the message.
    ///
    pub fn new_with_payload(id: MessageId, payload: MessagePayload) -> Self {
        Message { id, payload }
    }

    /// Serialize message into a length-prefixed frame.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        // A keep-alive serializes as a bare zero length prefix
        if self.id == MESSAGE_KEEPALIVE {
            return Ok(vec![0; 4]);
        }

        // Get message length
        let message_len = 1 + self.payload.len();

        // Create a new buffer
        let mut serialized: Vec<u8> = Vec::with_capacity(4 + message_len);

        // Add message length
        serialized.write_u32::<BigEndian>(message_len as u32)?;

        // Add message id
        serialized.push(self.id);

        // Add message payload
        serialized.extend_from_slice(&self.payload);

        Ok(serialized)
    }
}

/// Read one message from a stream.
///
/// Returns the keep-alive sentinel for frames with a zero length prefix.
/// A frame whose declared length exceeds the available bytes is an error.
pub fn read<R: Read>(reader: &mut R) -> Result<Message> {
    // Read message length
    let mut len_buf = [0; 4];
    if reader.read_exact(&mut len_buf).is_err() {
        return Err(anyhow!("could not read message length received from peer"));
    }
    let message_len = Cursor::new(len_buf).read_u32::<BigEndian>()? as usize;

    // A zero length denotes a keep-alive
    if message_len == 0 {
        return Ok(Message::new(MESSAGE_KEEPALIVE));
    }

    // Read message id and payload
    let mut message_buf: Vec<u8> = vec![0; message_len];
    if reader.read_exact(&mut message_buf).is_err() {
        return Err(anyhow!("could not read message received from peer"));
    }

    Ok(Message::new_with_payload(
        message_buf[0],
        message_buf[1..].to_vec(),
    ))
}

/// Build a REQUEST message for a block.
pub fn format_request(index: u32, begin: u32, length: u32) -> Result<Message> {
    let mut payload: Vec<u8> = vec![];
    payload.write_u32::<BigEndian>(index)?;
    payload.write_u32::<BigEndian>(begin)?;
    payload.write_u32::<BigEndian>(length)?;

    Ok(Message::new_with_payload(MESSAGE_REQUEST, payload))
}

/// Build a PIECE message carrying a block of data.
#[allow(dead_code)]
pub fn format_piece(index: u32, begin: u32, block: &[u8]) -> Result<Message> {
    let mut payload: Vec<u8> = Vec::with_capacity(8 + block.len());
    payload.write_u32::<BigEndian>(index)?;
    payload.write_u32::<BigEndian>(begin)?;
    payload.extend_from_slice(block);

    Ok(Message::new_with_payload(MESSAGE_PIECE, payload))
}

/// Build a HAVE message for a completed piece.
pub fn format_have(index: u32) -> Result<Message> {
    let mut payload: Vec<u8> = vec![];
    payload.write_u32::<BigEndian>(index)?;

    Ok(Message::new_with_payload(MESSAGE_HAVE, payload))
}

/// Parse a HAVE message and return the announced piece index.
pub fn parse_have(message: &Message) -> Result<u32> {
    // Check if message id and payload are valid
    if message.id != MESSAGE_HAVE || message.payload.len() != 4 {
        return Err(anyhow!("received invalid MESSAGE_HAVE from peer"));
    }

    // Get piece index
    let index = Cursor::new(&message.payload).read_u32::<BigEndian>()?;

    Ok(index)
}

/// Parse a PIECE message and copy its block into a piece buffer.
///
/// Returns the number of bytes written into `buf`.
///
/// # Arguments
///
/// * `index` - The piece currently being downloaded.
/// * `buf` - The assembly buffer for that piece.
/// * `message` - The PIECE message to parse.
///
pub fn parse_piece(index: u32, buf: &mut [u8], message: &Message) -> Result<u32> {
    // Check if message id and payload are valid
    if message.id != MESSAGE_PIECE {
        return Err(anyhow!("received invalid MESSAGE_PIECE from peer"));
    }
    if message.payload.len() < 8 {
        return Err(anyhow!("received truncated MESSAGE_PIECE from peer"));
    }

    // Check the block belongs to the expected piece
    let mut payload_cursor = Cursor::new(&message.payload[0..8]);
    let parsed_index = payload_cursor.read_u32::<BigEndian>()?;
    if parsed_index != index {
        return Err(anyhow!(
            "received block for piece {} while downloading piece {}",
            parsed_index,
            index
        ));
    }

    // Check the block fits in the piece buffer
    let begin = payload_cursor.read_u32::<BigEndian>()? as usize;
    if begin >= buf.len() {
        return Err(anyhow!(
            "received block with invalid byte offset within piece"
        ));
    }
    let block = &message.payload[8..];
    if begin + block.len() > buf.len() {
        return Err(anyhow!("received block too long for piece"));
    }

    // Copy the block into the piece buffer
    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len() as u32)
}

/// Parse a REQUEST message into its (index, begin, length) triple.
#[allow(dead_code)]
pub fn parse_request(message: &Message) -> Result<(u32, u32, u32)> {
    // Check if message id and payload are valid
    if message.id != MESSAGE_REQUEST || message.payload.len() != 12 {
        return Err(anyhow!("received invalid MESSAGE_REQUEST from peer"));
    }

    let mut payload_cursor = Cursor::new(&message.payload);
    let index = payload_cursor.read_u32::<BigEndian>()?;
    let begin = payload_cursor.read_u32::<BigEndian>()?;
    let length = payload_cursor.read_u32::<BigEndian>()?;

    Ok((index, begin, length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_keep_alive() {
        let message = Message::new(MESSAGE_KEEPALIVE);
        assert_eq!(message.serialize().unwrap(), vec![0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn read_keep_alive() {
        let frame = vec![0x00, 0x00, 0x00, 0x00];
        let message = read(&mut Cursor::new(&frame)).unwrap();
        assert_eq!(message.id, MESSAGE_KEEPALIVE);
        assert!(message.payload.is_empty());
        assert_eq!(message.serialize().unwrap(), frame);
    }

    #[test]
    fn serialize_request_frame() {
        let message = format_request(1, 2, 3).unwrap();
        assert_eq!(
            message.serialize().unwrap(),
            vec![
                0x00, 0x00, 0x00, 0x0D, 0x06, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
                0x00, 0x00, 0x00, 0x03
            ]
        );
    }

    #[test]
    fn read_then_parse_request() {
        let frame = format_request(1, 2, 3).unwrap().serialize().unwrap();
        let message = read(&mut Cursor::new(&frame)).unwrap();
        assert_eq!(parse_request(&message).unwrap(), (1, 2, 3));
    }

    #[test]
    fn read_round_trips_frames() {
        let frames = [
            Message::new(MESSAGE_UNCHOKE).serialize().unwrap(),
            format_have(42).unwrap().serialize().unwrap(),
            format_piece(0, 16384, &[0xAB; 64]).unwrap().serialize().unwrap(),
            Message::new(MESSAGE_KEEPALIVE).serialize().unwrap(),
        ];
        for frame in frames {
            let message = read(&mut Cursor::new(&frame)).unwrap();
            assert_eq!(message.serialize().unwrap(), frame);
        }
    }

    #[test]
    fn read_rejects_truncated_frame() {
        // Declared length of 5 with only 2 bytes available
        let frame = vec![0x00, 0x00, 0x00, 0x05, 0x07, 0x00];
        assert!(read(&mut Cursor::new(&frame)).is_err());
    }

    #[test]
    fn read_rejects_missing_length_prefix() {
        let frame = vec![0x00, 0x00];
        assert!(read(&mut Cursor::new(&frame)).is_err());
    }

    #[test]
    fn parse_have_returns_index() {
        let message = format_have(7).unwrap();
        assert_eq!(parse_have(&message).unwrap(), 7);
    }

    #[test]
    fn parse_have_rejects_bad_id_or_length() {
        let wrong_id = Message::new_with_payload(MESSAGE_PIECE, vec![0; 4]);
        assert!(parse_have(&wrong_id).is_err());

        let wrong_len = Message::new_with_payload(MESSAGE_HAVE, vec![0; 3]);
        assert!(parse_have(&wrong_len).is_err());
    }

    #[test]
    fn parse_piece_copies_block() {
        let mut buf = vec![0; 10];
        let message = format_piece(4, 2, &[0xAA, 0xBB, 0xCC]).unwrap();
        let n = parse_piece(4, &mut buf, &message).unwrap();
        assert_eq!(n, 3);
        assert_eq!(buf, vec![0, 0, 0xAA, 0xBB, 0xCC, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn parse_piece_rejects_wrong_index() {
        let mut buf = vec![0; 10];
        let message = format_piece(5, 0, &[0xAA]).unwrap();
        assert!(parse_piece(4, &mut buf, &message).is_err());
    }

    #[test]
    fn parse_piece_rejects_offset_past_buffer() {
        let mut buf = vec![0; 10];
        let message = format_piece(4, 10, &[0xAA]).unwrap();
        assert!(parse_piece(4, &mut buf, &message).is_err());
    }

    #[test]
    fn parse_piece_rejects_block_overflowing_buffer() {
        let mut buf = vec![0; 10];
        let message = format_piece(4, 8, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert!(parse_piece(4, &mut buf, &message).is_err());
    }

    #[test]
    fn parse_piece_rejects_short_payload() {
        let mut buf = vec![0; 10];
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![0; 7]);
        assert!(parse_piece(4, &mut buf, &message).is_err());
    }

    #[test]
    fn parse_piece_accepts_overlapping_blocks() {
        let mut buf = vec![0; 4];
        let first = format_piece(0, 0, &[1, 2, 3, 4]).unwrap();
        let second = format_piece(0, 2, &[9, 9]).unwrap();
        parse_piece(0, &mut buf, &first).unwrap();
        parse_piece(0, &mut buf, &second).unwrap();
        assert_eq!(buf, vec![1, 2, 9, 9]);
    }

    #[test]
    fn parse_request_rejects_bad_length() {
        let message = Message::new_with_payload(MESSAGE_REQUEST, vec![0; 11]);
        assert!(parse_request(&message).is_err());
    }
}
