//! Driver error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by the bus collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum BusError {
    #[error("No such device")]
    NoDevice,

    #[error("Out of DMA-capable memory")]
    NoMemory,

    #[error("Endpoint busy")]
    Busy,

    #[error("Invalid transfer parameters")]
    InvalidParam,

    #[error("Access denied")]
    Access,

    #[error("Bus I/O error")]
    Io,

    #[error("{message}")]
    Other { message: String },
}

/// Errors reported by the input collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum InputError {
    #[error("Input subsystem rejected device: {0}")]
    Rejected(String),

    #[error("Input subsystem is shutting down")]
    Closed,
}

/// Why a device cannot be driven as a boot mouse
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UnsupportedReason {
    #[error("expected exactly one non-control endpoint, found {0}")]
    EndpointCount(usize),

    #[error("endpoint {address:#04x} is not interrupt IN")]
    NotInterruptIn { address: u8 },

    #[error("endpoint {address:#04x} max packet size {max_packet_size} is shorter than a boot report")]
    PacketTooSmall { address: u8, max_packet_size: u16 },
}

/// Driver-level errors
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum DriverError {
    /// The bus could not provide a DMA-capable transfer buffer
    #[error("Cannot allocate transfer buffer: {0}")]
    Allocation(BusError),

    /// The device does not look like a boot mouse; never retried
    #[error("Unsupported device: {0}")]
    UnsupportedDevice(#[from] UnsupportedReason),

    /// The bus refused the interrupt transfer
    #[error("Transfer submission failed: {0}")]
    Submission(BusError),

    /// Opening the session failed
    #[error("I/O error: {0}")]
    Io(BusError),

    /// The input subsystem refused the device
    #[error("Input registration failed: {0}")]
    Registration(#[from] InputError),

    /// The session was detached; the reference is stale
    #[error("Device session is gone")]
    SessionGone,

    /// The session has not finished attaching
    #[error("Device session is not ready")]
    NotReady,

    /// The transfer loop already has a transfer in flight
    #[error("Transfer loop is already active")]
    AlreadyActive,

    /// The transfer loop stopped and must be reset before restarting
    #[error("Transfer loop is stopped")]
    LoopStopped,

    /// The buffer is still checked out to an in-flight transfer
    #[error("Transfer buffer is still referenced by an in-flight transfer")]
    BufferInFlight,
}

/// Type alias for driver results
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::UnsupportedDevice(UnsupportedReason::EndpointCount(2));
        let msg = format!("{}", err);
        assert!(msg.contains("Unsupported device"));
        assert!(msg.contains("found 2"));

        let err = DriverError::UnsupportedDevice(UnsupportedReason::NotInterruptIn {
            address: 0x02,
        });
        assert!(format!("{}", err).contains("0x02"));

        let err = UnsupportedReason::PacketTooSmall {
            address: 0x81,
            max_packet_size: 2,
        };
        assert!(format!("{}", err).contains("max packet size 2"));
    }

    #[test]
    fn test_registration_error_conversion() {
        let err: DriverError = InputError::Rejected("busy".to_string()).into();
        assert!(matches!(err, DriverError::Registration(_)));
        assert!(format!("{}", err).contains("busy"));
    }
}
