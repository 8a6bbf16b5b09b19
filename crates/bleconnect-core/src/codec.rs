//! Chunk codec: MTU-bounded splitting and end-of-message framing
//!
//! Messages travel as a run of data chunks followed by a single end-of-message
//! marker chunk. Nothing here holds state; the sender and the reassembly buffer
//! build on these functions.
//!
//! The marker is matched by whole-chunk equality. A payload whose bytes happen
//! to contain the marker can still produce a data chunk equal to it, which the
//! receiver cannot tell apart from a real end of message. Use
//! [`contains_end_marker`] to detect such payloads before sending.

use core::iter::{Chain, FusedIterator, Once};

use crate::protocol::END_OF_MESSAGE;

// ----------------------------------------------------------------------------
// Splitting
// ----------------------------------------------------------------------------

/// Lazy, restartable sequence of MTU-bounded chunks over a payload.
///
/// Cloning a `Chunks` restarts nothing; it forks the cursor, so the clone
/// yields exactly what the original would yield from the same point.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    payload: &'a [u8],
    mtu: usize,
    offset: usize,
}

impl<'a> Chunks<'a> {
    /// Bytes already yielded.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes not yet yielded.
    pub fn remaining(&self) -> &'a [u8] {
        &self.payload[self.offset..]
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        let chunk = chunk_at(self.payload, self.offset, self.mtu);
        self.offset += chunk.len();
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = chunk_count(self.payload.len() - self.offset, self.mtu);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

impl FusedIterator for Chunks<'_> {}

/// Split `payload` into consecutive chunks of at most `mtu` bytes.
///
/// # Panics
///
/// Panics if `mtu` is zero.
pub fn split(payload: &[u8], mtu: usize) -> Chunks<'_> {
    assert!(mtu > 0, "chunk size must be non-zero");
    Chunks {
        payload,
        mtu,
        offset: 0,
    }
}

/// The chunk that starts at `offset`: `min(mtu, remaining)` bytes.
///
/// Returns an empty slice once `offset` reaches the end of the payload.
pub fn chunk_at(payload: &[u8], offset: usize, mtu: usize) -> &[u8] {
    let start = offset.min(payload.len());
    let end = start.saturating_add(mtu).min(payload.len());
    &payload[start..end]
}

/// Number of data chunks a payload of `len` bytes splits into.
pub fn chunk_count(len: usize, mtu: usize) -> usize {
    if len == 0 {
        0
    } else {
        (len - 1) / mtu + 1
    }
}

// ----------------------------------------------------------------------------
// End-of-Message Framing
// ----------------------------------------------------------------------------

/// True if `chunk` is the default end-of-message marker.
pub fn is_end_marker(chunk: &[u8]) -> bool {
    matches_marker(chunk, END_OF_MESSAGE)
}

/// True if `chunk` equals a configured end-of-message marker.
pub fn matches_marker(chunk: &[u8], marker: &[u8]) -> bool {
    chunk == marker
}

/// True if the marker bytes appear anywhere inside `payload`.
pub fn contains_end_marker(payload: &[u8], marker: &[u8]) -> bool {
    !marker.is_empty()
        && payload.len() >= marker.len()
        && payload.windows(marker.len()).any(|w| w == marker)
}

/// Full transmission sequence for one message: data chunks, then the marker.
pub fn frame<'a>(payload: &'a [u8], mtu: usize, marker: &'a [u8]) -> Chain<Chunks<'a>, Once<&'a [u8]>> {
    split(payload, mtu).chain(core::iter::once(marker))
}
