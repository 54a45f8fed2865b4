//! Message framing over size-limited channels.
//!
//! Outbound envelopes larger than the chunk threshold are split into
//! ordered `CHUNK` frames. Inbound fragments are buffered per sending peer
//! and by index, so duplicates and out-of-order arrival are tolerated;
//! nothing is handed on until every fragment is present.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use plansync_shared::constants::MAX_CHUNKS;
use plansync_shared::protocol::WireMessage;
use plansync_shared::types::PeerId;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chunk size must be positive")]
    ZeroChunkSize,

    #[error("Chunk size {size} cannot hold a chunk frame, minimum is {min}")]
    ChunkSizeTooSmall { size: usize, min: usize },

    #[error("Message needs {needed} chunks, limit is {max}")]
    TooManyChunks { needed: usize, max: u32 },

    #[error("Invalid chunk {index}/{total}")]
    InvalidChunk { index: u32, total: u32 },
}

/// Serialize `message` and split it into frames of at most `chunk_size`
/// bytes each, `CHUNK` envelope included. Small messages yield a single
/// frame holding the message.
pub fn encode_frames(message: &WireMessage, chunk_size: usize) -> Result<Vec<String>, FramingError> {
    let text = message.to_json()?;
    split_frames(&text, chunk_size)
}

/// Frame an already serialized envelope.
pub fn split_frames(text: &str, chunk_size: usize) -> Result<Vec<String>, FramingError> {
    if chunk_size == 0 {
        return Err(FramingError::ZeroChunkSize);
    }
    if text.len() <= chunk_size {
        return Ok(vec![text.to_string()]);
    }

    // Sized for the widest index/total so every frame fits whatever the count.
    let overhead = WireMessage::Chunk {
        index: MAX_CHUNKS - 1,
        total: MAX_CHUNKS,
        data: String::new(),
    }
    .to_json()?
    .len();
    let min = overhead + MAX_ESCAPED_CHAR;
    if chunk_size < min {
        return Err(FramingError::ChunkSizeTooSmall { size: chunk_size, min });
    }

    let pieces = split_escaped(text, chunk_size - overhead);
    if pieces.len() > MAX_CHUNKS as usize {
        return Err(FramingError::TooManyChunks {
            needed: pieces.len(),
            max: MAX_CHUNKS,
        });
    }

    let total = pieces.len() as u32;
    debug!(bytes = text.len(), total, "Splitting message into chunks");

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| {
            WireMessage::Chunk {
                index: index as u32,
                total,
                data: data.to_string(),
            }
            .to_json()
            .map_err(FramingError::from)
        })
        .collect()
}

/// Widest JSON form of one character (`\u001f`).
const MAX_ESCAPED_CHAR: usize = 6;

/// Bytes `c` occupies inside a JSON string literal.
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\u{08}' | '\u{0c}' | '\n' | '\r' | '\t' => 2,
        c if (c as u32) < 0x20 => MAX_ESCAPED_CHAR,
        c => c.len_utf8(),
    }
}

/// Split on character boundaries so each piece, once JSON-escaped, fits
/// in `budget` bytes.
fn split_escaped(text: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (i, c) in text.char_indices() {
        let width = escaped_len(c);
        if used + width > budget {
            pieces.push(&text[start..i]);
            start = i;
            used = 0;
        }
        used += width;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

struct ChunkBuffer {
    parts: Vec<Option<String>>,
    received: u32,
}

impl ChunkBuffer {
    fn new(total: u32) -> Self {
        Self {
            parts: vec![None; total as usize],
            received: 0,
        }
    }

    fn total(&self) -> u32 {
        self.parts.len() as u32
    }
}

/// Per-peer reassembly buffers.
#[derive(Default)]
pub struct Reassembler {
    buffers: HashMap<PeerId, ChunkBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one fragment. Returns the complete message text once the last
    /// missing fragment arrives.
    pub fn accept(
        &mut self,
        peer: &PeerId,
        index: u32,
        total: u32,
        data: String,
    ) -> Result<Option<String>, FramingError> {
        if total == 0 || total > MAX_CHUNKS || index >= total {
            self.buffers.remove(peer);
            return Err(FramingError::InvalidChunk { index, total });
        }

        let restart = self
            .buffers
            .get(peer)
            .map(|buffer| buffer.total() != total)
            .unwrap_or(false);
        if restart {
            warn!(
                peer = %peer.short(),
                total,
                "Chunk total changed mid-transfer, discarding partial message"
            );
            self.buffers.remove(peer);
        }

        let buffer = self
            .buffers
            .entry(peer.clone())
            .or_insert_with(|| ChunkBuffer::new(total));

        let slot = &mut buffer.parts[index as usize];
        if slot.is_none() {
            *slot = Some(data);
            buffer.received += 1;
        }

        if buffer.received < buffer.total() {
            return Ok(None);
        }

        let Some(complete) = self.buffers.remove(peer) else {
            return Ok(None);
        };
        let message: String = complete.parts.into_iter().flatten().collect();
        debug!(peer = %peer.short(), total, bytes = message.len(), "Reassembled chunked message");
        Ok(Some(message))
    }

    /// Drop whatever partial transfer `peer` left behind.
    pub fn discard(&mut self, peer: &PeerId) -> bool {
        let dropped = self.buffers.remove(peer).is_some();
        if dropped {
            debug!(peer = %peer.short(), "Discarded partial chunk buffer");
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    pub fn pending_peers(&self) -> usize {
        self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plansync_shared::constants::CHUNK_SIZE;
    use plansync_shared::crypto::Ciphertext;

    fn big_update(bytes: usize) -> WireMessage {
        WireMessage::SyncUpdate {
            events: Ciphertext {
                iv: "AAAAAAAAAAAAAAAA".into(),
                data: "é".repeat(bytes / 2),
            },
            class_colors: Ciphertext {
                iv: "AAAAAAAAAAAAAAAA".into(),
                data: String::new(),
            },
            timestamp: 1,
        }
    }

    fn fragments(frames: &[String]) -> Vec<(u32, u32, String)> {
        frames
            .iter()
            .map(|f| match WireMessage::from_json(f).unwrap() {
                WireMessage::Chunk { index, total, data } => (index, total, data),
                other => panic!("expected chunk, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_small_message_single_frame() {
        let frames = encode_frames(&WireMessage::Ping, 1024).unwrap();
        assert_eq!(frames, vec![r#"{"type":"PING"}"#.to_string()]);
    }

    #[test]
    fn test_chunks_respect_size_and_char_boundaries() {
        let msg = big_update(50_000);
        let frames = encode_frames(&msg, 1000).unwrap();
        let parts = fragments(&frames);

        assert!(parts.len() > 1);
        for (i, (index, total, _)) in parts.iter().enumerate() {
            assert_eq!(*index as usize, i);
            assert_eq!(*total as usize, parts.len());
        }
        for frame in &frames {
            assert!(frame.len() <= 1000, "frame of {} bytes", frame.len());
        }
    }

    #[test]
    fn test_frames_fit_channel_limit() {
        let mut msg = big_update(0);
        if let WireMessage::SyncUpdate { events, .. } = &mut msg {
            events.data = "A".repeat(60_000);
        }
        let frames = encode_frames(&msg, CHUNK_SIZE).unwrap();
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.len() <= CHUNK_SIZE, "frame of {} bytes", frame.len());
        }
    }

    #[test]
    fn test_escaped_text_fits_and_reassembles() {
        // Quotes, backslashes and control characters grow when escaped.
        let text = "\"\\\n\u{1}é".repeat(3_000);
        let frames = split_frames(&text, 512).unwrap();
        for frame in &frames {
            assert!(frame.len() <= 512, "frame of {} bytes", frame.len());
        }

        let peer = PeerId::new("p");
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for (index, total, data) in fragments(&frames) {
            result = reassembler.accept(&peer, index, total, data).unwrap();
        }
        assert_eq!(result.unwrap(), text);
    }

    #[test]
    fn test_chunk_size_below_envelope_rejected() {
        let text = "x".repeat(200);
        assert!(matches!(
            split_frames(&text, 40),
            Err(FramingError::ChunkSizeTooSmall { size: 40, .. })
        ));
    }

    #[test]
    fn test_reassembly_in_order() {
        let msg = big_update(40_000);
        let original = msg.to_json().unwrap();
        let parts = fragments(&encode_frames(&msg, 4096).unwrap());
        let peer = PeerId::new("p");
        let mut reassembler = Reassembler::new();

        let mut result = None;
        for (index, total, data) in parts {
            assert!(result.is_none());
            result = reassembler.accept(&peer, index, total, data).unwrap();
        }
        assert_eq!(result.unwrap(), original);
        assert_eq!(reassembler.pending_peers(), 0);
    }

    #[test]
    fn test_reassembly_out_of_order_with_duplicates() {
        let msg = big_update(40_000);
        let original = msg.to_json().unwrap();
        let mut parts = fragments(&encode_frames(&msg, 4096).unwrap());
        parts.reverse();
        let dup = parts[0].clone();
        parts.insert(1, dup);

        let peer = PeerId::new("p");
        let mut reassembler = Reassembler::new();
        let mut outputs: Vec<String> = Vec::new();
        for (index, total, data) in parts {
            if let Some(done) = reassembler.accept(&peer, index, total, data).unwrap() {
                outputs.push(done);
            }
        }
        assert_eq!(outputs, vec![original]);
    }

    #[test]
    fn test_buffers_are_per_peer() {
        let mut reassembler = Reassembler::new();
        let a = PeerId::new("a");
        let b = PeerId::new("b");

        assert!(reassembler.accept(&a, 0, 2, "A0".into()).unwrap().is_none());
        assert!(reassembler.accept(&b, 1, 2, "B1".into()).unwrap().is_none());
        assert_eq!(reassembler.accept(&a, 1, 2, "A1".into()).unwrap().unwrap(), "A0A1");
        assert_eq!(reassembler.accept(&b, 0, 2, "B0".into()).unwrap().unwrap(), "B0B1");
    }

    #[test]
    fn test_discard_drops_partial_transfer() {
        let mut reassembler = Reassembler::new();
        let peer = PeerId::new("p");
        reassembler.accept(&peer, 0, 3, "x".into()).unwrap();

        assert!(reassembler.discard(&peer));
        assert!(!reassembler.discard(&peer));

        // A fresh transfer does not see the old fragment.
        reassembler.accept(&peer, 1, 2, "b".into()).unwrap();
        assert_eq!(reassembler.accept(&peer, 0, 2, "a".into()).unwrap().unwrap(), "ab");
    }

    #[test]
    fn test_total_change_restarts_buffer() {
        let mut reassembler = Reassembler::new();
        let peer = PeerId::new("p");
        reassembler.accept(&peer, 0, 3, "old".into()).unwrap();

        assert!(reassembler.accept(&peer, 0, 2, "n".into()).unwrap().is_none());
        assert_eq!(reassembler.accept(&peer, 1, 2, "ew".into()).unwrap().unwrap(), "new");
    }

    #[test]
    fn test_invalid_chunks_rejected() {
        let mut reassembler = Reassembler::new();
        let peer = PeerId::new("p");
        assert!(reassembler.accept(&peer, 0, 0, String::new()).is_err());
        assert!(reassembler.accept(&peer, 2, 2, String::new()).is_err());
        assert!(reassembler.accept(&peer, 0, MAX_CHUNKS + 1, String::new()).is_err());
        assert_eq!(reassembler.pending_peers(), 0);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(
            split_frames("abc", 0),
            Err(FramingError::ZeroChunkSize)
        ));
    }
}
