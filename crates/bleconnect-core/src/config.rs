//! Session configuration
//!
//! One configuration is shared by both roles so that the producer and consumer
//! agree on identifiers, chunk size and end-of-message marker.

use uuid::Uuid;

use crate::errors::ConfigError;
use crate::protocol::{
    END_OF_MESSAGE, NOTIFY_MTU, PROXIMITY_THRESHOLD_DBM, TRANSFER_CHARACTERISTIC_UUID,
    TRANSFER_SERVICE_UUID,
};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for a producer or consumer session
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Service the consumer scans for and the producer publishes
    pub capability_id: Uuid,
    /// Notify characteristic inside the service
    pub channel_id: Uuid,
    /// Transmission-unit ceiling for a single chunk
    pub max_chunk_bytes: usize,
    /// End-of-message marker, sent as its own chunk
    pub end_marker: Vec<u8>,
    /// Weakest RSSI (dBm) the consumer will connect at
    pub proximity_threshold_dbm: i16,
    /// Re-enter scanning after an unintentional session loss
    pub auto_rescan: bool,
    /// Ask the transport to report repeated advertisements from the same peer
    pub allow_duplicate_advertisements: bool,
    /// Consecutive discovery failures before the consumer gives up
    pub max_discovery_failures: u32,
    /// Upper bound on a reassembled message, enforced by the consumer session
    pub max_message_bytes: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capability_id: TRANSFER_SERVICE_UUID,
            channel_id: TRANSFER_CHARACTERISTIC_UUID,
            max_chunk_bytes: NOTIFY_MTU,
            end_marker: END_OF_MESSAGE.to_vec(),
            proximity_threshold_dbm: PROXIMITY_THRESHOLD_DBM,
            auto_rescan: true,
            allow_duplicate_advertisements: true,
            max_discovery_failures: 3,
            max_message_bytes: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with protocol defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept candidates at any signal strength
    pub fn testing() -> Self {
        Self {
            proximity_threshold_dbm: -100,
            ..Self::default()
        }
    }

    /// Connect to peers across a room rather than only at arm's length
    pub fn long_range() -> Self {
        Self {
            proximity_threshold_dbm: -90,
            ..Self::default()
        }
    }

    /// Set the capability (service) identifier
    pub fn with_capability_id(mut self, id: Uuid) -> Self {
        self.capability_id = id;
        self
    }

    /// Set the channel (characteristic) identifier
    pub fn with_channel_id(mut self, id: Uuid) -> Self {
        self.channel_id = id;
        self
    }

    /// Set the maximum chunk size
    pub fn with_max_chunk_bytes(mut self, size: usize) -> Self {
        self.max_chunk_bytes = size;
        self
    }

    /// Set the end-of-message marker
    pub fn with_end_marker(mut self, marker: impl Into<Vec<u8>>) -> Self {
        self.end_marker = marker.into();
        self
    }

    /// Set the proximity threshold
    pub fn with_proximity_threshold(mut self, dbm: i16) -> Self {
        self.proximity_threshold_dbm = dbm;
        self
    }

    /// Enable or disable automatic rescanning after link loss
    pub fn with_auto_rescan(mut self, enabled: bool) -> Self {
        self.auto_rescan = enabled;
        self
    }

    /// Set the discovery failure budget
    pub fn with_max_discovery_failures(mut self, attempts: u32) -> Self {
        self.max_discovery_failures = attempts;
        self
    }

    /// Bound the size of a reassembled message
    pub fn with_max_message_bytes(mut self, max: Option<usize>) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "Chunk size must be greater than 0".into(),
            ));
        }
        if self.end_marker.is_empty() {
            return Err(ConfigError::Invalid(
                "End-of-message marker cannot be empty".into(),
            ));
        }
        if self.end_marker.len() > self.max_chunk_bytes {
            return Err(ConfigError::Invalid(format!(
                "End-of-message marker ({} bytes) does not fit in one chunk ({} bytes)",
                self.end_marker.len(),
                self.max_chunk_bytes
            )));
        }
        if self.max_message_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "Maximum message size cannot be zero".into(),
            ));
        }
        if self.max_discovery_failures == 0 {
            return Err(ConfigError::Invalid(
                "Discovery failure budget cannot be zero".into(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
