//! Framing: fixed header (type, payload size, sender ID; big-endian) + bincode payload.
//!
//! [`FramedChannel`] decodes incrementally: bytes are fed as they arrive and a
//! frame is only produced once its header and its whole payload are buffered.

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::{Hash, HASH_SIZE};
use crate::protocol::MessageType;

/// Header: 4 bytes type + 4 bytes payload size + sender ID.
pub const HEADER_SIZE: usize = 4 + 4 + HASH_SIZE;
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024; // 16 MiB

/// Fully parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub payload_size: u32,
    pub sender_id: Hash,
}

impl MessageHeader {
    pub fn new(message_type: MessageType, payload_size: u32, sender_id: Hash) -> Self {
        Self {
            message_type,
            payload_size,
            sender_id,
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.message_type.as_u32().to_be_bytes());
        out[4..8].copy_from_slice(&self.payload_size.to_be_bytes());
        out[8..].copy_from_slice(self.sender_id.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let tag = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut sender = [0u8; HASH_SIZE];
        sender.copy_from_slice(&bytes[8..HEADER_SIZE]);
        Self {
            message_type: MessageType::from_u32(tag),
            payload_size: size,
            sender_id: Hash::from_bytes(sender),
        }
    }
}

/// A header and the exact payload bytes it announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Decode the payload. The bytes are already consumed from the stream, so a
    /// failure here only loses this message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameDecodeError> {
        bincode::deserialize(&self.payload).map_err(FrameDecodeError::Decode)
    }
}

/// Encode a frame. `payload = None` produces a header-only frame.
pub fn encode_frame<T: Serialize>(
    message_type: MessageType,
    sender_id: Hash,
    payload: Option<&T>,
) -> Result<Vec<u8>, FrameEncodeError> {
    let body = match payload {
        Some(p) => bincode::serialize(p).map_err(FrameEncodeError::Encode)?,
        None => Vec::new(),
    };
    if body.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let header = MessageHeader::new(message_type, body.len() as u32, sender_id);
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encode a frame and write it to `writer`.
pub fn write_message<W: Write, T: Serialize>(
    writer: &mut W,
    message_type: MessageType,
    sender_id: Hash,
    payload: Option<&T>,
) -> Result<(), FrameEncodeError> {
    let frame = encode_frame(message_type, sender_id, payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Error encoding or writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("frame too large")]
    TooLarge,
    #[error("write error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error decoding a frame or its payload.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    /// Header announced more than [`MAX_PAYLOAD_SIZE`]; the stream cannot be trusted.
    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(u32),
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}

/// Incremental decoder over the inbound half of a byte stream.
#[derive(Debug, Default)]
pub struct FramedChannel {
    buffer: Vec<u8>,
    pending_header: Option<MessageHeader>,
}

impl FramedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Produce the next complete frame, or `Ok(None)` when more bytes are needed.
    /// Never consumes bytes of an incomplete frame's payload.
    pub fn try_decode_next(&mut self) -> Result<Option<Frame>, FrameDecodeError> {
        if self.pending_header.is_none() {
            if self.buffer.len() < HEADER_SIZE {
                return Ok(None);
            }
            let header = MessageHeader::from_bytes(&self.buffer[..HEADER_SIZE]);
            if header.payload_size > MAX_PAYLOAD_SIZE {
                return Err(FrameDecodeError::TooLarge(header.payload_size));
            }
            self.buffer.drain(..HEADER_SIZE);
            self.pending_header = Some(header);
        }
        let size = match &self.pending_header {
            Some(h) => h.payload_size as usize,
            None => return Ok(None),
        };
        if self.buffer.len() < size {
            return Ok(None);
        }
        let payload: Vec<u8> = self.buffer.drain(..size).collect();
        match self.pending_header.take() {
            Some(header) => Ok(Some(Frame { header, payload })),
            None => Ok(None),
        }
    }

    /// Header parsed but payload still incomplete.
    pub fn pending_header(&self) -> Option<&MessageHeader> {
        self.pending_header.as_ref()
    }

    /// Bytes buffered and not yet part of a returned frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all buffered state (new connection).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending_header = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChatMessage, EventChatMessage, Tag};

    fn sample_stream() -> (Vec<u8>, Hash) {
        let sender = Hash::random();
        let mut bytes = Vec::new();
        bytes.extend(
            encode_frame(
                MessageType::EventChatMessage,
                sender,
                Some(&EventChatMessage {
                    peer_id: Hash::random(),
                    message: "hello".into(),
                }),
            )
            .unwrap(),
        );
        bytes.extend(encode_frame::<()>(MessageType::Refresh, sender, None).unwrap());
        bytes.extend(
            encode_frame(MessageType::SearchTag, sender, Some(&Tag { tag: 42 })).unwrap(),
        );
        (bytes, sender)
    }

    fn drain(channel: &mut FramedChannel) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = channel.try_decode_next().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn chunk_size_does_not_change_output() {
        let (bytes, _) = sample_stream();
        let mut whole = FramedChannel::new();
        whole.feed(&bytes);
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), 3);

        for chunk in [1usize, 2, 3, 7, 27, 28, 29, 100] {
            let mut channel = FramedChannel::new();
            let mut got = Vec::new();
            for piece in bytes.chunks(chunk) {
                channel.feed(piece);
                got.extend(drain(&mut channel));
            }
            assert_eq!(got, expected, "chunk size {chunk}");
            assert_eq!(channel.buffered(), 0);
            assert!(channel.pending_header().is_none());
        }
    }

    #[test]
    fn header_only_frame() {
        let sender = Hash::random();
        let bytes = encode_frame::<()>(MessageType::Refresh, sender, None).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let mut channel = FramedChannel::new();
        channel.feed(&bytes);
        let frame = channel.try_decode_next().unwrap().expect("frame");
        assert_eq!(frame.header.message_type, MessageType::Refresh);
        assert_eq!(frame.header.payload_size, 0);
        assert_eq!(frame.header.sender_id, sender);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn partial_header_consumes_nothing() {
        let (bytes, _) = sample_stream();
        let mut channel = FramedChannel::new();
        channel.feed(&bytes[..HEADER_SIZE - 1]);
        assert!(channel.try_decode_next().unwrap().is_none());
        assert_eq!(channel.buffered(), HEADER_SIZE - 1);
        assert!(channel.pending_header().is_none());
    }

    #[test]
    fn partial_payload_keeps_header_pending() {
        let (bytes, _) = sample_stream();
        let mut channel = FramedChannel::new();
        channel.feed(&bytes[..HEADER_SIZE + 1]);
        assert!(channel.try_decode_next().unwrap().is_none());
        assert!(channel.pending_header().is_some());
        assert_eq!(channel.buffered(), 1);
    }

    #[test]
    fn empty_feed_is_noop() {
        let mut channel = FramedChannel::new();
        channel.feed(&[]);
        assert!(channel.try_decode_next().unwrap().is_none());
        assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn bad_payload_keeps_alignment() {
        let sender = Hash::random();
        let mut bytes = Vec::new();
        // Header claims a chat message but the body is garbage.
        let garbage = [0xffu8; 5];
        let mut bad = encode_frame::<()>(MessageType::ChatMessage, sender, None).unwrap();
        bad[4..8].copy_from_slice(&(garbage.len() as u32).to_be_bytes());
        bad.extend_from_slice(&garbage);
        bytes.extend(bad);
        bytes.extend(encode_frame(MessageType::SearchTag, sender, Some(&Tag { tag: 7 })).unwrap());

        let mut channel = FramedChannel::new();
        channel.feed(&bytes);
        let first = channel.try_decode_next().unwrap().expect("first frame");
        assert!(first.decode::<ChatMessage>().is_err());
        let second = channel.try_decode_next().unwrap().expect("second frame");
        assert_eq!(second.decode::<Tag>().unwrap(), Tag { tag: 7 });
    }

    #[test]
    fn oversized_header_is_rejected() {
        let sender = Hash::random();
        let mut bytes = encode_frame::<()>(MessageType::State, sender, None).unwrap();
        bytes[4..8].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        let mut channel = FramedChannel::new();
        channel.feed(&bytes);
        assert!(matches!(
            channel.try_decode_next(),
            Err(FrameDecodeError::TooLarge(_))
        ));
    }

    #[test]
    fn write_message_matches_encode() {
        let sender = Hash::random();
        let msg = ChatMessage {
            message: "hi".into(),
        };
        let mut out = Vec::new();
        write_message(&mut out, MessageType::ChatMessage, sender, Some(&msg)).unwrap();
        assert_eq!(
            out,
            encode_frame(MessageType::ChatMessage, sender, Some(&msg)).unwrap()
        );
    }
}
