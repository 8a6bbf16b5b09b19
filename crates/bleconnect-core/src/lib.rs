//! BLEConnect Core Transfer Protocol
//!
//! Moves a text message from a producer to a consumer over a link that only
//! carries small notification-sized chunks. The producer splits the message
//! into MTU-bounded chunks, pushes them through a credit-gated channel and
//! terminates the message with a sentinel chunk. The consumer discovers and
//! subscribes to the producer, then reassembles chunks until the sentinel
//! arrives.
//!
//! Everything here is sans-IO: sessions consume events and return effects, and
//! the caller owns the radio. See `bleconnect-runtime` for async drivers.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod codec;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod producer;
pub mod protocol;
pub mod reassembly;
pub mod resumption;
pub mod sender;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use codec::{chunk_count, frame, split, Chunks};
pub use config::SessionConfig;
pub use consumer::{ConsumerEvent, ConsumerSession, Effect, Effects, SessionState, Transition};
pub use errors::{
    BleConnectError, ConfigError, DecodeError, DiscoveryStage, Result, SendError, SessionError,
};
pub use producer::{
    ProducerEffect, ProducerEvent, ProducerSession, ProducerState, ProducerStep,
};
pub use protocol::{
    END_OF_MESSAGE, NOTIFY_MTU, PROXIMITY_THRESHOLD_DBM, TRANSFER_CHARACTERISTIC_UUID,
    TRANSFER_SERVICE_UUID,
};
pub use reassembly::{ReassemblyBuffer, ReassemblyOutcome};
pub use resumption::{PriorLinkState, PriorPeripheralState};
pub use sender::{ChunkSink, DrainOutcome, FlowControlledSender, TransferState, WriteOutcome};
