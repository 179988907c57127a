//! Text codec for terminal frames.
//!
//! # Frame Format
//!
//! The transport (a WebSocket) already delivers message boundaries, so a
//! frame is exactly one UTF-8 text message containing one JSON object:
//!
//! ```text
//! {"kind":"output","data":"\u001b[1mhello\u001b[0m\r\n"}
//! ```
//!
//! No length prefix and no sequence numbers are used; ordering within one
//! direction is the transport's guarantee.
//!
//! # Output bytes
//!
//! Process output is an opaque byte stream but frame payloads are strings.
//! [`Utf8StreamDecoder`] converts chunks to text without ever splitting a
//! multi-byte character across two frames: an incomplete trailing sequence
//! is held back and completed by the next chunk.

use serde::Deserialize;

use crate::error::{ProtocolError, Result};
use crate::messages::{Decoded, Frame};

/// Maximum size of a single text frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Wire names of every frame kind this version understands.
pub const KNOWN_KINDS: &[&str] = &["input", "output", "resize", "connected", "exit"];

/// Encoder and decoder for text frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Largest accepted frame, in bytes.
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Used to tell an unknown kind apart from a malformed frame.
#[derive(Deserialize)]
struct KindTag {
    kind: String,
}

impl FrameCodec {
    /// Create a new codec with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a new codec with a custom size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the configured size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame into its text form.
    pub fn encode(&self, frame: &Frame) -> Result<String> {
        let text = serde_json::to_string(frame)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        if text.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }

        Ok(text)
    }

    /// Decode one text frame.
    ///
    /// Objects with an unrecognised `kind` decode to [`Decoded::Unknown`]
    /// so receivers can ignore them. Anything else that fails to parse is
    /// a [`ProtocolError::Deserialization`].
    pub fn decode(&self, text: &str) -> Result<Decoded> {
        if text.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }

        match serde_json::from_str::<Frame>(text) {
            Ok(frame) => Ok(Decoded::Frame(frame)),
            Err(err) => {
                if let Ok(tag) = serde_json::from_str::<KindTag>(text) {
                    if !KNOWN_KINDS.contains(&tag.kind.as_str()) {
                        return Ok(Decoded::Unknown(tag.kind));
                    }
                }
                Err(ProtocolError::Deserialization(err.to_string()))
            }
        }
    }
}

/// Incremental UTF-8 decoder for process output.
///
/// Invalid byte sequences are replaced with U+FFFD. At most three bytes are
/// ever held back between calls.
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    /// Incomplete sequence left over from the previous chunk.
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of bytes held back waiting for completion.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Decode the next chunk of the stream.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let buffer;
        let mut rest: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            buffer = joined;
            &buffer
        };

        let mut out = String::with_capacity(rest.len());
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));
                    match err.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid_up_to + invalid_len..];
                        }
                        None => {
                            self.pending = rest[valid_up_to..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush the decoder at end of stream.
    ///
    /// A dangling incomplete sequence becomes a single U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}
