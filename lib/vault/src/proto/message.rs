use crate::proto::support::{ProtoError, ProtoResult};
use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Size of the fixed header carried by every message.
pub const HEADER_SIZE: usize = 2;

/// Length prefix in front of each body entry.
pub const LENGTH_SIZE: usize = 2;

/// Size of the scratch buffers shared by the server and the accessor; no
/// frame may exceed it.
pub const MAX_MESSAGE_SIZE: usize = 2000;

/// Request and reply types. Integers are host endian throughout; the
/// protocol never leaves the machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    Add = 2,
    Query = 3,
    Delete = 4,
    Ok = 5,
    Failed = 6,
    Result = 7,
    Terminate = 8,
}

impl From<MessageType> for u8 {
    #[inline]
    fn from(message_type: MessageType) -> Self {
        message_type as u8
    }
}

impl MessageType {
    #[inline]
    pub fn from_tag(tag: u8) -> ProtoResult<MessageType> {
        Ok(match tag {
            0 => MessageType::Ping,
            1 => MessageType::Pong,
            2 => MessageType::Add,
            3 => MessageType::Query,
            4 => MessageType::Delete,
            5 => MessageType::Ok,
            6 => MessageType::Failed,
            7 => MessageType::Result,
            8 => MessageType::Terminate,
            _ => return Err(ProtoError::UnknownType(tag)),
        })
    }
}

/// Flag bits, meaningful per message type.
pub mod flags {
    /// `Add`: overwrite an existing entry instead of failing.
    pub const REPLACE_EXISTING: u8 = 1;
    /// `Query`: report existence only, carry no value in the reply.
    pub const EXISTENCE_ONLY: u8 = 1;
    /// `Query`: remove the entry once the reply is determined.
    pub const DELETE_SECRET: u8 = 1 << 1;
    /// `Delete`: removing a missing key still succeeds.
    pub const ALLOW_MISSING: u8 = 1;
    /// `Failed`: a single entry description follows the header.
    pub const DESCRIPTION_ATTACHED: u8 = 1;
}

/// Writes a bodyless message into the scratch buffer and returns the frame
/// length. Exactly the header goes on the wire, never stale scratch bytes.
#[inline]
pub fn encode_empty(scratch: &mut [u8], message_type: MessageType, flags: u8) -> ProtoResult<usize> {
    if HEADER_SIZE > scratch.len() {
        return Err(ProtoError::Oversized);
    }

    let mut stream = &mut scratch[..];
    stream.write_u8(message_type.into())?;
    stream.write_u8(flags)?;

    Ok(HEADER_SIZE)
}

/// Writes a message with a single length prefixed entry and returns the
/// frame length.
pub fn encode_single(
    scratch: &mut [u8],
    message_type: MessageType,
    flags: u8,
    entry: &[u8],
) -> ProtoResult<usize> {
    let total = HEADER_SIZE + LENGTH_SIZE + entry.len();
    if total > scratch.len() || entry.len() > u16::max_value() as usize {
        return Err(ProtoError::Oversized);
    }

    let mut stream = &mut scratch[..];
    stream.write_u8(message_type.into())?;
    stream.write_u8(flags)?;
    stream.write_u16::<NativeEndian>(entry.len() as u16)?;
    stream.write_all(entry)?;

    Ok(total)
}

/// Writes a message with two length prefixed entries stored back to back
/// and returns the frame length.
pub fn encode_double(
    scratch: &mut [u8],
    message_type: MessageType,
    flags: u8,
    first: &[u8],
    second: &[u8],
) -> ProtoResult<usize> {
    let total = HEADER_SIZE + 2 * LENGTH_SIZE + first.len() + second.len();
    if total > scratch.len()
        || first.len() > u16::max_value() as usize
        || second.len() > u16::max_value() as usize
    {
        return Err(ProtoError::Oversized);
    }

    let mut stream = &mut scratch[..];
    stream.write_u8(message_type.into())?;
    stream.write_u8(flags)?;
    stream.write_u16::<NativeEndian>(first.len() as u16)?;
    stream.write_u16::<NativeEndian>(second.len() as u16)?;
    stream.write_all(first)?;
    stream.write_all(second)?;

    Ok(total)
}

/// Reads the two byte header, blocking until it fully arrives. A short read
/// means the peer went away.
#[inline]
pub fn read_header<R: Read>(stream: &mut R) -> ProtoResult<(u8, u8)> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    Ok((header[0], header[1]))
}

/// Reads a single entry body into the scratch buffer and returns the entry
/// length. A body larger than the scratch buffer is rejected, not
/// truncated.
pub fn read_single<R: Read>(stream: &mut R, scratch: &mut [u8]) -> ProtoResult<usize> {
    let length = stream.read_u16::<NativeEndian>()? as usize;
    if length > scratch.len() {
        return Err(ProtoError::Oversized);
    }
    stream.read_exact(&mut scratch[..length])?;
    Ok(length)
}

/// Reads a double entry body into the scratch buffer; the entries land back
/// to back and their lengths are returned.
pub fn read_double<R: Read>(stream: &mut R, scratch: &mut [u8]) -> ProtoResult<(usize, usize)> {
    let first = stream.read_u16::<NativeEndian>()? as usize;
    let second = stream.read_u16::<NativeEndian>()? as usize;
    if first + second > scratch.len() {
        return Err(ProtoError::Oversized);
    }
    stream.read_exact(&mut scratch[..first + second])?;
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_empty_frame_is_header_only() {
        let mut scratch = [0xEEu8; 32];

        let length = encode_empty(&mut scratch, MessageType::Ok, 0).unwrap();

        assert_eq!(length, 2);
        assert_eq!(scratch[0], u8::from(MessageType::Ok));
        assert_eq!(scratch[1], 0);
        // Stale scratch content stays outside the frame.
        assert_eq!(scratch[2], 0xEE);
    }

    #[test]
    fn test_single_entry_roundtrip() {
        let mut scratch = [0u8; 64];

        let length =
            encode_single(&mut scratch, MessageType::Query, flags::EXISTENCE_ONLY, b"api-key").unwrap();

        let mut stream = Cursor::new(&scratch[..length]);
        let (tag, header_flags) = read_header(&mut stream).unwrap();
        assert_eq!(MessageType::from_tag(tag).unwrap(), MessageType::Query);
        assert_eq!(header_flags, flags::EXISTENCE_ONLY);

        let mut body = [0u8; 64];
        let body_length = read_single(&mut stream, &mut body).unwrap();
        assert_eq!(&body[..body_length], b"api-key");
    }

    #[test]
    fn test_double_entry_roundtrip() {
        let mut scratch = [0u8; 64];

        let length = encode_double(
            &mut scratch,
            MessageType::Add,
            flags::REPLACE_EXISTING,
            b"key",
            b"value",
        )
        .unwrap();

        let mut stream = Cursor::new(&scratch[..length]);
        let (tag, header_flags) = read_header(&mut stream).unwrap();
        assert_eq!(MessageType::from_tag(tag).unwrap(), MessageType::Add);
        assert_eq!(header_flags, flags::REPLACE_EXISTING);

        let mut body = [0u8; 64];
        let (first, second) = read_double(&mut stream, &mut body).unwrap();
        assert_eq!(&body[..first], b"key");
        assert_eq!(&body[first..first + second], b"value");
    }

    #[test]
    fn test_encode_rejects_oversized_entry() {
        let mut scratch = [0u8; 16];

        let result = encode_single(&mut scratch, MessageType::Add, 0, &[0u8; 32]);

        assert_eq!(result.unwrap_err(), ProtoError::Oversized);
    }

    #[test]
    fn test_encode_double_rejects_combined_overflow() {
        let mut scratch = [0u8; 16];

        // Each entry fits on its own, together they overflow.
        let result = encode_double(&mut scratch, MessageType::Add, 0, &[0u8; 8], &[0u8; 8]);

        assert_eq!(result.unwrap_err(), ProtoError::Oversized);
    }

    #[test]
    fn test_read_rejects_oversized_body() {
        let mut scratch = [0u8; 128];
        let length = encode_single(&mut scratch, MessageType::Ping, 0, &[7u8; 100]).unwrap();

        let mut stream = Cursor::new(&scratch[HEADER_SIZE..length]);
        let mut body = [0u8; 10];

        let result = read_single(&mut stream, &mut body);

        assert_eq!(result.unwrap_err(), ProtoError::Oversized);
    }

    #[test]
    fn test_short_header_is_a_disconnect() {
        let mut stream = Cursor::new(&[0u8][..]);

        let result = read_header(&mut stream);

        assert_eq!(result.unwrap_err(), ProtoError::Disconnected);
    }

    #[test]
    fn test_short_body_is_a_disconnect() {
        // Declares 100 bytes but delivers 3.
        let mut frame = [0u8; 16];
        let mut stream = &mut frame[..];
        stream.write_u16::<NativeEndian>(100).unwrap();
        stream.write_all(&[1, 2, 3]).unwrap();

        let mut cursor = Cursor::new(&frame[..5]);
        let mut body = [0u8; 128];

        let result = read_single(&mut cursor, &mut body);

        assert_eq!(result.unwrap_err(), ProtoError::Disconnected);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert_eq!(MessageType::from_tag(9).unwrap_err(), ProtoError::UnknownType(9));
        assert_eq!(MessageType::from_tag(255).unwrap_err(), ProtoError::UnknownType(255));
    }

    #[test]
    fn test_tag_values_are_stable() {
        // The wire depends on these exact values.
        assert_eq!(u8::from(MessageType::Ping), 0);
        assert_eq!(u8::from(MessageType::Pong), 1);
        assert_eq!(u8::from(MessageType::Add), 2);
        assert_eq!(u8::from(MessageType::Query), 3);
        assert_eq!(u8::from(MessageType::Delete), 4);
        assert_eq!(u8::from(MessageType::Ok), 5);
        assert_eq!(u8::from(MessageType::Failed), 6);
        assert_eq!(u8::from(MessageType::Result), 7);
        assert_eq!(u8::from(MessageType::Terminate), 8);
    }
}
