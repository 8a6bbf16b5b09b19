//! Bluetooth Low Energy central transport for BLEConnect
//!
//! Runs the consumer role of the transfer protocol on a host adapter through
//! btleplug. The producer role needs a peripheral stack, which btleplug does
//! not provide; use any [`bleconnect_runtime::PeripheralTransport`] for it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use bleconnect_ble::{BleCentralConfig, BtleplugCentral};
//! use bleconnect_runtime::{event_channel, ConsumerTask, SessionConfig, TaskConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (events_tx, events_rx) = event_channel();
//! let central = BtleplugCentral::new(BleCentralConfig::default(), events_tx).await?;
//! let consumer = ConsumerTask::spawn(
//!     SessionConfig::default(),
//!     &TaskConfig::default(),
//!     central,
//!     events_rx,
//! );
//! let mut app_events = consumer.subscribe();
//! while let Ok(event) = app_events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

mod candidate;
mod central;
mod config;
mod error;

pub use candidate::{Candidate, CandidateTable};
pub use central::BtleplugCentral;
pub use config::BleCentralConfig;
pub use error::BleTransportError;

pub use btleplug::platform::PeripheralId;
