//! Producer-side flow-controlled sender
//!
//! Pushes one message through a credit-gated channel. Each write either lands
//! or is rejected for backpressure; a rejection freezes the cursor and hands
//! control back until the transport signals spare capacity again.

use tracing::{debug, trace, warn};

use crate::codec::{chunk_at, contains_end_marker};
use crate::config::SessionConfig;
use crate::errors::SendError;
use crate::protocol::{END_OF_MESSAGE, NOTIFY_MTU};

// ----------------------------------------------------------------------------
// Channel Seam
// ----------------------------------------------------------------------------

/// Result of a single write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The unit was queued for delivery
    Accepted,
    /// The transmit queue is full; retry after capacity returns
    Backpressure,
}

/// Channel the sender writes chunks into
pub trait ChunkSink {
    /// Offer one chunk to every current subscriber
    fn write(&mut self, chunk: &[u8]) -> WriteOutcome;
}

impl<S: ChunkSink + ?Sized> ChunkSink for &mut S {
    fn write(&mut self, chunk: &[u8]) -> WriteOutcome {
        (**self).write(chunk)
    }
}

// ----------------------------------------------------------------------------
// Pending Transfer
// ----------------------------------------------------------------------------

/// Lifecycle of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    NotStarted,
    Sending,
    EomQueued,
    Complete,
}

/// Producer-owned state of the message being sent
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    payload: Vec<u8>,
    cursor: usize,
    eom_pending: bool,
    in_flight: bool,
    state: TransferState,
}

impl PendingTransfer {
    fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            cursor: 0,
            eom_pending: false,
            in_flight: false,
            state: TransferState::NotStarted,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Offset of the next unsent byte
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn eom_pending(&self) -> bool {
        self.eom_pending
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn state(&self) -> TransferState {
        self.state
    }
}

/// Where a drain pass stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing to send
    Idle,
    /// Backpressure hit; waiting for capacity
    Paused { cursor: usize, eom_pending: bool },
    /// End marker accepted; the transfer is finished
    Complete { bytes: usize },
}

// ----------------------------------------------------------------------------
// Flow-Controlled Sender
// ----------------------------------------------------------------------------

/// Drives a single pending transfer through a [`ChunkSink`]
#[derive(Debug, Clone)]
pub struct FlowControlledSender {
    mtu: usize,
    end_marker: Vec<u8>,
    transfer: Option<PendingTransfer>,
}

impl Default for FlowControlledSender {
    fn default() -> Self {
        Self::new(NOTIFY_MTU, END_OF_MESSAGE)
    }
}

impl FlowControlledSender {
    /// Create a sender for the given chunk size and marker.
    ///
    /// # Panics
    ///
    /// Panics if `mtu` is zero.
    pub fn new(mtu: usize, end_marker: impl Into<Vec<u8>>) -> Self {
        assert!(mtu > 0, "chunk size must be non-zero");
        Self {
            mtu,
            end_marker: end_marker.into(),
            transfer: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_chunk_bytes, config.end_marker.clone())
    }

    /// True while a transfer is being pushed
    pub fn is_in_flight(&self) -> bool {
        self.transfer.as_ref().is_some_and(PendingTransfer::in_flight)
    }

    pub fn transfer(&self) -> Option<&PendingTransfer> {
        self.transfer.as_ref()
    }

    /// Capture `payload` and start sending it.
    ///
    /// Rejected with [`SendError::AlreadyInFlight`] while another transfer is
    /// still being pushed; the running transfer is left untouched.
    pub fn begin(
        &mut self,
        payload: impl Into<Vec<u8>>,
        sink: &mut impl ChunkSink,
    ) -> Result<DrainOutcome, SendError> {
        if self.is_in_flight() {
            return Err(SendError::AlreadyInFlight);
        }

        let payload = payload.into();
        if contains_end_marker(&payload, &self.end_marker) {
            warn!(
                bytes = payload.len(),
                "Payload contains the end-of-message marker; the receiver may cut it short"
            );
        }

        let mut transfer = PendingTransfer::new(payload);
        transfer.in_flight = true;
        transfer.state = TransferState::Sending;
        debug!(bytes = transfer.payload.len(), "Transfer started");
        self.transfer = Some(transfer);

        Ok(self.drain(sink))
    }

    /// Send while the channel accepts writes.
    pub fn drain(&mut self, sink: &mut impl ChunkSink) -> DrainOutcome {
        let Self {
            mtu,
            end_marker,
            transfer,
        } = self;
        let Some(pending) = transfer.as_mut() else {
            return DrainOutcome::Idle;
        };

        let outcome = loop {
            match pending.state {
                TransferState::Sending => {
                    if pending.cursor == pending.payload.len() {
                        pending.state = TransferState::EomQueued;
                        pending.eom_pending = true;
                        continue;
                    }
                    let chunk = chunk_at(&pending.payload, pending.cursor, *mtu);
                    match sink.write(chunk) {
                        WriteOutcome::Accepted => {
                            pending.cursor += chunk.len();
                            trace!(cursor = pending.cursor, "Chunk accepted");
                        }
                        WriteOutcome::Backpressure => {
                            break DrainOutcome::Paused {
                                cursor: pending.cursor,
                                eom_pending: false,
                            };
                        }
                    }
                }
                TransferState::EomQueued => match sink.write(end_marker.as_slice()) {
                    WriteOutcome::Accepted => {
                        pending.eom_pending = false;
                        pending.in_flight = false;
                        pending.state = TransferState::Complete;
                        break DrainOutcome::Complete {
                            bytes: pending.payload.len(),
                        };
                    }
                    WriteOutcome::Backpressure => {
                        break DrainOutcome::Paused {
                            cursor: pending.cursor,
                            eom_pending: true,
                        };
                    }
                },
                TransferState::NotStarted | TransferState::Complete => break DrainOutcome::Idle,
            }
        };

        match outcome {
            DrainOutcome::Complete { bytes } => {
                debug!(bytes, "Transfer complete");
                *transfer = None;
            }
            DrainOutcome::Paused { cursor, eom_pending } => {
                trace!(cursor, eom_pending, "Backpressure, waiting for capacity");
            }
            DrainOutcome::Idle => {}
        }
        outcome
    }

    /// Capacity signal from the transport. A no-op without a transfer.
    pub fn on_capacity_available(&mut self, sink: &mut impl ChunkSink) -> DrainOutcome {
        self.drain(sink)
    }

    /// Stop the current transfer where it is. Nothing already written is
    /// recalled; the receiver simply never sees the end marker.
    pub fn halt(&mut self) -> Option<PendingTransfer> {
        let halted = self.transfer.take();
        if let Some(transfer) = &halted {
            debug!(
                cursor = transfer.cursor,
                bytes = transfer.payload.len(),
                "Transfer halted"
            );
        }
        halted
    }
}
