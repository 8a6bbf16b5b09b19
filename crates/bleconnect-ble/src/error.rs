//! Error types for the BLE central

use bleconnect_runtime::TransportError;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors specific to the btleplug central
#[derive(Error, Debug)]
pub enum BleTransportError {
    #[error("BLE adapter not available")]
    AdapterNotAvailable,

    #[error("Failed to get BLE events: {0}")]
    EventStreamFailed(String),

    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(String),

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(String),

    #[error("Bluetooth error: {0}")]
    Btleplug(#[from] btleplug::Error),
}

impl From<BleTransportError> for TransportError {
    fn from(err: BleTransportError) -> Self {
        match err {
            BleTransportError::PeripheralNotFound(id) => TransportError::UnknownLink(id),
            other => TransportError::Adapter(other.to_string()),
        }
    }
}
