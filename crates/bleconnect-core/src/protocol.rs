//! Protocol constants shared by the producer and consumer roles

use uuid::Uuid;

// ----------------------------------------------------------------------------
// Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// Transfer service advertised by the producer (the capability)
pub const TRANSFER_SERVICE_UUID: Uuid = Uuid::from_u128(0xE71EE188_279F_4ED6_8055_12D77BFD900C);

/// Notify-only characteristic that carries message chunks (the channel)
pub const TRANSFER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x2F016955_E675_49A6_9176_111E2A1CF333);

// ----------------------------------------------------------------------------
// Framing
// ----------------------------------------------------------------------------

/// End-of-message marker, always the last unit of a message
pub const END_OF_MESSAGE: &[u8] = b"{{{EOM}}}";

/// Largest notification payload the link carries
pub const NOTIFY_MTU: usize = 20;

// ----------------------------------------------------------------------------
// Discovery
// ----------------------------------------------------------------------------

/// Weakest RSSI (dBm) at which a candidate is considered close enough to connect
pub const PROXIMITY_THRESHOLD_DBM: i16 = -35;

/// Key a platform uses to hand a restored central session back to the consumer
pub const CENTRAL_RESTORE_IDENTIFIER: &str = "io.cloudcity.BLEConnect.CentralManager";

/// Key a platform uses to hand a restored peripheral session back to the producer
pub const PERIPHERAL_RESTORE_IDENTIFIER: &str = "io.cloudcity.BLEConnect.PeripheralManager";

/// Proximity admission filter: at or above the threshold passes.
pub fn is_within_range(rssi: i16, threshold_dbm: i16) -> bool {
    rssi >= threshold_dbm
}
