//! Transport seams for the async drivers
//!
//! A transport carries out the effects a session emits and reports what the
//! radio does as session events through an [`EventSender`]. Effects are
//! executed in order and one at a time; results always come back as events,
//! never as return values.

use async_trait::async_trait;
use bleconnect_core::{ChunkSink, Effect, ProducerEffect};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Sending half of a transport event channel
pub type EventSender<E> = mpsc::UnboundedSender<E>;

/// Receiving half of a transport event channel
pub type EventReceiver<E> = mpsc::UnboundedReceiver<E>;

/// Create the channel a transport uses to report events to its session task
pub fn event_channel<E>() -> (EventSender<E>, EventReceiver<E>) {
    mpsc::unbounded_channel()
}

/// Consumer-side radio (the scanning, connecting role)
#[async_trait]
pub trait CentralTransport<C>: Send
where
    C: Send + 'static,
{
    /// Carry out one transport effect. Only effects for which
    /// [`Effect::is_transport`] holds are passed in.
    async fn execute(&mut self, effect: Effect<C>) -> Result<(), TransportError>;
}

/// Producer-side radio (the advertising, notifying role)
///
/// Chunk writes go through [`ChunkSink`] synchronously so the sender can
/// observe backpressure on every write.
#[async_trait]
pub trait PeripheralTransport: ChunkSink + Send {
    async fn execute(&mut self, effect: ProducerEffect) -> Result<(), TransportError>;
}
