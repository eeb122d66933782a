use thiserror::Error;
use uuid::Uuid;

use crate::types::{PeripheralId, RadioStatus};

/// Errors that can occur when discovering or controlling saber stands
#[derive(Error, Debug)]
pub enum SaberError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is present on the host
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter is present but not in a usable state
    #[error("Bluetooth adapter unavailable: {status}")]
    AdapterUnavailable {
        /// Status reported by the adapter at the time of the request
        status: RadioStatus,
    },

    /// Peripheral is not known to the radio stack
    #[error("Peripheral not found: {0}")]
    PeripheralNotFound(PeripheralId),

    /// Connection attempt was rejected by the radio stack
    #[error("Failed to connect to peripheral: {0}")]
    ConnectionFailed(String),

    /// A radio call did not resolve in time
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Name of the radio operation that timed out
        operation: &'static str,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Characteristic read was rejected
    #[error("Characteristic read failed: {0}")]
    ReadFailed(String),

    /// Characteristic write was rejected
    #[error("Characteristic write rejected: {0}")]
    WriteRejected(String),

    /// The service descriptors of the connection are gone, e.g. after a disconnect
    #[error("Lost connection to the device")]
    LostConnection,

    /// The connected peripheral does not expose the stand service
    #[error("Service not found: {0}")]
    ServiceNotFound(Uuid),

    /// Retrieved service map does not contain the expected indices
    #[error("No characteristic at service {service_index} / characteristic {characteristic_index}")]
    MissingCharacteristic {
        /// Service index looked up
        service_index: usize,
        /// Characteristic index looked up
        characteristic_index: usize,
    },

    /// Manufacturer data is absent or too short
    #[error("Malformed advertisement: {0}")]
    MalformedAdvertisement(String),

    /// Hex string has odd length or non-hex digits
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    /// Colour string does not match `#rrggbb`
    #[error("Invalid color: {0}")]
    InvalidColor(String),
}

/// Result type for saber operations
pub type Result<T> = std::result::Result<T, SaberError>;

impl SaberError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::LostConnection
                | Self::PeripheralNotFound(_)
        )
    }

    /// Check if this error is a transient radio failure the user may retry
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Timeout { .. }
                | Self::ReadFailed(_)
                | Self::WriteRejected(_)
                | Self::LostConnection
        )
    }

    /// Check if the user has to change adapter settings before retrying
    #[must_use]
    pub const fn requires_user_action(&self) -> bool {
        matches!(self, Self::AdapterNotFound | Self::AdapterUnavailable { .. })
    }
}
