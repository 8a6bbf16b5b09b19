//! BLE central configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the btleplug central
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BleCentralConfig {
    /// Which host adapter to use when several are present
    pub adapter_index: usize,
    /// Maximum time to wait for a connection
    pub connection_timeout: Duration,
    /// Maximum time to wait for service discovery
    pub discovery_timeout: Duration,
}

impl Default for BleCentralConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            connection_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

impl BleCentralConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the adapter by position
    pub fn with_adapter_index(mut self, index: usize) -> Self {
        self.adapter_index = index;
        self
    }

    /// Set connection timeout
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set service discovery timeout
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}
