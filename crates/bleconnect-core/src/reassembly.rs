//! Consumer-side reassembly of chunked messages
//!
//! Chunks are appended until the end-of-message marker arrives; the marker
//! flushes the accumulated bytes as one message and empties the buffer.
//!
//! Chunks are cut on byte offsets, so a character may straddle two chunks.
//! The trailing bytes of such a character are held back and joined with the
//! next chunk before validation.

use core::str::Utf8Error;

use tracing::{debug, trace, warn};

use crate::codec::matches_marker;
use crate::errors::DecodeError;
use crate::protocol::END_OF_MESSAGE;

// ----------------------------------------------------------------------------
// Reassembly Outcome
// ----------------------------------------------------------------------------

/// Result of feeding one chunk into the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// Chunk appended, more expected
    MessageInProgress,
    /// End marker received; the buffer has been emptied
    MessageComplete(String),
}

// ----------------------------------------------------------------------------
// Reassembly Buffer
// ----------------------------------------------------------------------------

/// Accumulates chunks of the single in-flight message
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    accumulated: Vec<u8>,
    /// Leading bytes of a character cut off at the end of the last chunk
    partial: Vec<u8>,
    end_marker: Vec<u8>,
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyBuffer {
    /// Create a buffer that recognises the default marker
    pub fn new() -> Self {
        Self::with_end_marker(END_OF_MESSAGE)
    }

    /// Create a buffer that recognises a configured marker
    pub fn with_end_marker(marker: impl Into<Vec<u8>>) -> Self {
        Self {
            accumulated: Vec::new(),
            partial: Vec::new(),
            end_marker: marker.into(),
        }
    }

    /// Feed one received chunk.
    ///
    /// A chunk holding bytes that can never form valid UTF-8 is rejected
    /// without touching the accumulated bytes; the message continues without
    /// it. A character cut off at the end of a chunk is completed by the next.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Result<ReassemblyOutcome, DecodeError> {
        if matches_marker(chunk, &self.end_marker) {
            if !self.partial.is_empty() {
                warn!(bytes = self.partial.len(), "Message ended inside a character");
                self.partial.clear();
            }
            let bytes = core::mem::take(&mut self.accumulated);
            let len = bytes.len();
            // Only whole characters are ever appended.
            let message = String::from_utf8(bytes)
                .map_err(|e| DecodeError::from_utf8(e.utf8_error(), len))?;
            debug!(bytes = len, "End of message received");
            return Ok(ReassemblyOutcome::MessageComplete(message));
        }

        let partial = core::mem::take(&mut self.partial);
        if !partial.is_empty() {
            let mut joined = partial;
            joined.extend_from_slice(chunk);
            if self.absorb(joined).is_ok() {
                return Ok(ReassemblyOutcome::MessageInProgress);
            }
            warn!("Incomplete character not continued by the next chunk, dropped");
        }

        self.absorb(chunk.to_vec())
            .map_err(|e| DecodeError::from_utf8(e, chunk.len()))?;
        Ok(ReassemblyOutcome::MessageInProgress)
    }

    /// Append the complete characters of `bytes`, holding back a trailing
    /// incomplete one. Invalid bytes leave the buffer untouched.
    fn absorb(&mut self, mut bytes: Vec<u8>) -> Result<(), Utf8Error> {
        let complete = match core::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(e) => return Err(e),
        };
        self.partial = bytes.split_off(complete);
        self.accumulated.extend_from_slice(&bytes);
        trace!(
            appended = complete,
            held = self.partial.len(),
            buffered = self.accumulated.len(),
            "Chunk appended"
        );
        Ok(())
    }

    /// Drop any partial message
    pub fn clear(&mut self) {
        self.accumulated.clear();
        self.partial.clear();
    }

    /// Bytes buffered for the in-flight message
    pub fn len(&self) -> usize {
        self.accumulated.len() + self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty() && self.partial.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.accumulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::split;

    #[test]
    fn test_hello_world_scenario() {
        let mut buffer = ReassemblyBuffer::new();
        for chunk in split(b"HELLO WORLD", 20) {
            assert_eq!(
                buffer.on_chunk(chunk).unwrap(),
                ReassemblyOutcome::MessageInProgress
            );
        }
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete("HELLO WORLD".to_string())
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_bad_chunk_is_dropped_without_corrupting_buffer() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.on_chunk(b"abc").unwrap();
        let err = buffer.on_chunk(&[0xFF]).unwrap_err();
        assert_eq!(err.len, 1);
        assert_eq!(buffer.as_bytes(), b"abc");
        buffer.on_chunk(b"def").unwrap();
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete("abcdef".to_string())
        );
    }

    #[test]
    fn test_character_split_across_chunks() {
        // 21 bytes: the seventh euro sign straddles the 20-byte boundary
        let text = "€€€€€€€";
        let mut buffer = ReassemblyBuffer::new();
        for chunk in split(text.as_bytes(), 20) {
            assert_eq!(
                buffer.on_chunk(chunk).unwrap(),
                ReassemblyOutcome::MessageInProgress
            );
        }
        assert_eq!(buffer.len(), 21);
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete(text.to_string())
        );
    }

    #[test]
    fn test_dangling_character_dropped_when_not_continued() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.on_chunk(b"abc").unwrap();
        // First byte of a two-byte character, then plain ASCII
        buffer.on_chunk(&[0xC3]).unwrap();
        buffer.on_chunk(b"def").unwrap();
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete("abcdef".to_string())
        );

        buffer.on_chunk(b"xyz").unwrap();
        buffer.on_chunk(&[0xE2, 0x82]).unwrap();
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete("xyz".to_string())
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_marker_on_empty_buffer_yields_empty_message() {
        let mut buffer = ReassemblyBuffer::new();
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete(String::new())
        );
    }

    #[test]
    fn test_no_bytes_carried_across_messages() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.on_chunk(b"first").unwrap();
        buffer.on_chunk(END_OF_MESSAGE).unwrap();
        buffer.on_chunk(b"second").unwrap();
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageComplete("second".to_string())
        );
    }

    #[test]
    fn test_custom_marker() {
        let mut buffer = ReassemblyBuffer::with_end_marker(b"<END>".to_vec());
        buffer.on_chunk(b"payload").unwrap();
        assert_eq!(
            buffer.on_chunk(END_OF_MESSAGE).unwrap(),
            ReassemblyOutcome::MessageInProgress
        );
        assert!(matches!(
            buffer.on_chunk(b"<END>").unwrap(),
            ReassemblyOutcome::MessageComplete(m) if m == "payload{{{EOM}}}"
        ));
    }

    #[test]
    fn test_clear_discards_partial_message() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.on_chunk(b"partial").unwrap();
        assert_eq!(buffer.len(), 7);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
