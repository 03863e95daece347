use thiserror::Error;

use crate::types::CharacteristicRole;

/// Errors that can occur while talking to a relay device
#[derive(Error, Debug)]
pub enum RelayError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Device not found during scanning
    #[error("Relay device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Operation attempted before the session reached `Ready`, or the
    /// characteristic backing a role was never resolved
    #[error("Characteristic for role {role} is not resolved")]
    CharacteristicsNotResolved {
        /// Role that could not be used
        role: CharacteristicRole,
    },

    /// Writing to a characteristic was rejected by the transport
    #[error("Transport write failed: {0}")]
    TransportWriteFailed(String),

    /// Reading a characteristic failed on the transport
    #[error("Transport read failed: {0}")]
    TransportReadFailed(String),

    /// The device answered with a payload that cannot be decoded
    #[error("Invalid response from device: {0}")]
    InvalidResponse(String),

    /// The session was torn down while the operation was waiting
    #[error("Operation cancelled: session disconnected")]
    Cancelled,

    /// Caller-supplied values were rejected before encoding
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A response is already awaited on this role
    #[error("An operation is already awaiting a response on {role}")]
    OperationInProgress {
        /// Role that already has a registered waiter
        role: CharacteristicRole,
    },

    /// Response or connection timeout
    #[error("Timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The supplied configuration cannot be used
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Cancelled
                | Self::DeviceNotFound
                | Self::CharacteristicsNotResolved { .. }
        )
    }

    /// Check if the caller may reasonably retry the same operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::OperationInProgress { .. }
                | Self::InvalidResponse(_)
                | Self::TransportReadFailed(_)
                | Self::TransportWriteFailed(_)
        )
    }
}
