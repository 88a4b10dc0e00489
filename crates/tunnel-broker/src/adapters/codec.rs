//! JSON text codec for tunnel frames.

use crate::domain::{CodecError, Frame};

/// Default maximum frame size (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encodes frames as JSON text and decodes them with a size guard
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn encode(&self, frame: &Frame) -> Result<String, CodecError> {
        Ok(serde_json::to_string(frame)?)
    }

    pub fn decode(&self, text: &str) -> Result<Frame, CodecError> {
        if text.len() > self.max_frame_size {
            return Err(CodecError::TooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary message carrying UTF-8 JSON
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<Frame, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)?;
        self.decode(text)
    }
}
