//! Driver error taxonomy.

use thiserror::Error;

use crate::protocol::HeaderError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum TcmError {
    #[error("Incorrect header marker (0x{marker:02X})")]
    Framing { marker: u8 },

    #[error("Incorrect continued-read chunk (marker 0x{marker:02X}, code 0x{code:02X})")]
    ContinuedRead { marker: u8, code: u8 },

    #[error("Incorrect message padding byte (0x{0:02X})")]
    Padding(u8),

    #[error("Bus transfer failed: {0}")]
    Bus(#[from] TransportError),

    #[error("Timed out waiting for response (command 0x{command:02X})")]
    Timeout { command: u8 },

    #[error("Blocking command issued from the message dispatch context")]
    InvalidContext,

    #[error("Failed to switch to {expected} (device reports {actual})")]
    ModeTransitionFailed { expected: String, actual: String },

    #[error("Device has been reset (command 0x{command:02X})")]
    DeviceReset { command: u8 },

    #[error("Copy fault: need {needed} bytes, {available} available")]
    CopyFault { needed: usize, available: usize },

    #[error("Failed to get valid response (command 0x{command:02X})")]
    Io { command: u8 },

    #[error("Command 0x{command:02X} rejected with status 0x{status:02X}")]
    CommandRejected { command: u8, status: u8 },

    #[error("Invalid length: {0}")]
    InvalidLength(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Module registry not initialized")]
    RegistryNotReady,

    #[error("Hardware reset line not available")]
    HardwareResetUnavailable,

    #[error("Timed out waiting for host download")]
    HostDownloadTimeout,

    #[error("No touch client registered for the {0} panel")]
    NoTouchClient(String),

    #[error("Device not detected: {0}")]
    NotDetected(String),

    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
}

impl TcmError {
    /// Errors that a higher layer may clear with a full reset and reinit.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TcmError::Framing { .. }
                | TcmError::ContinuedRead { .. }
                | TcmError::Padding(_)
                | TcmError::Bus(_)
                | TcmError::Timeout { .. }
                | TcmError::DeviceReset { .. }
                | TcmError::Io { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TcmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TcmError::Timeout { command: 0x23 };
        assert_eq!(
            err.to_string(),
            "Timed out waiting for response (command 0x23)"
        );
        let err = TcmError::Padding(0xFF);
        assert_eq!(err.to_string(), "Incorrect message padding byte (0xFF)");
    }

    #[test]
    fn test_recoverable_classes() {
        assert!(TcmError::Framing { marker: 0 }.is_recoverable());
        assert!(TcmError::Timeout { command: 0x02 }.is_recoverable());
        assert!(!TcmError::InvalidContext.is_recoverable());
        assert!(!TcmError::RegistryNotReady.is_recoverable());
    }
}
