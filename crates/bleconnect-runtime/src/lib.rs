//! BLEConnect Runtime
//!
//! Async drivers for the sans-IO sessions in `bleconnect-core`:
//! - `ConsumerTask`: scans, connects, subscribes and reassembles messages
//! - `ProducerTask`: publishes the capability and streams content
//! - `LoopbackRadio`: an in-memory radio connecting both roles for tests
//!
//! Transports plug in through [`CentralTransport`] and [`PeripheralTransport`].

pub mod config;
pub mod consumer;
pub mod error;
pub mod loopback;
pub mod producer;
pub mod transport;

pub use config::TaskConfig;
pub use consumer::{AppEvent, ConsumerCommand, ConsumerHandle, ConsumerTask};
pub use error::{RuntimeError, RuntimeResult, TransportError};
pub use loopback::{
    LoopbackCentral, LoopbackConfig, LoopbackPeer, LoopbackPeripheral, LoopbackRadio,
    LoopbackStats,
};
pub use producer::{ProducerCommand, ProducerHandle, ProducerTask, TransferEvent};
pub use transport::{event_channel, CentralTransport, EventReceiver, EventSender, PeripheralTransport};

// Re-export core types for convenience
pub use bleconnect_core::{
    ConsumerEvent, Effect, PriorLinkState, PriorPeripheralState, ProducerEffect, ProducerEvent,
    ProducerState, SessionConfig, SessionError, SessionState,
};
