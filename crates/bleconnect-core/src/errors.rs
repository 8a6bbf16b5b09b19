//! Error types for the transfer protocol
//!
//! Transport-level failures are folded into session events and never leave the
//! session boundary; the types here are what the session reports as
//! diagnostics, and what the caller sees for its own contract violations.

use core::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Discovery step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryStage {
    /// The transfer service was not found on the connected link
    Capability,
    /// The transfer characteristic was not found inside the service
    Channel,
    /// The link refused the notification subscription
    Subscription,
}

impl fmt::Display for DiscoveryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryStage::Capability => write!(f, "capability"),
            DiscoveryStage::Channel => write!(f, "channel"),
            DiscoveryStage::Subscription => write!(f, "subscription"),
        }
    }
}

/// A received chunk was not valid text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Chunk of {len} bytes is not valid UTF-8 (valid up to byte {valid_up_to})")]
pub struct DecodeError {
    pub valid_up_to: usize,
    pub len: usize,
}

impl DecodeError {
    pub(crate) fn from_utf8(err: core::str::Utf8Error, len: usize) -> Self {
        Self {
            valid_up_to: err.valid_up_to(),
            len,
        }
    }
}

/// Errors returned to the caller of the flow-controlled sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("A transfer is already in flight")]
    AlreadyInFlight,
}

/// Session-level error taxonomy
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Connection failed: {reason}")]
    ConnectionFailure { reason: String },

    #[error("Failed to discover {stage}: {reason}")]
    DiscoveryFailure {
        stage: DiscoveryStage,
        reason: String,
    },

    #[error("Chunk dropped: {0}")]
    DecodeFailure(#[from] DecodeError),

    #[error("A transfer is already in flight")]
    AlreadyInFlight,

    #[error("Stale signal ignored")]
    StaleSignalIgnored,

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },
}

impl From<SendError> for SessionError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::AlreadyInFlight => SessionError::AlreadyInFlight,
        }
    }
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

/// Crate-level error unifying the specific error types
#[derive(Debug, thiserror::Error)]
pub enum BleConnectError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T> = core::result::Result<T, BleConnectError>;
