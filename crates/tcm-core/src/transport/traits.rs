//! Bus and board collaborator abstractions.
//!
//! `TcmBus` is the raw byte pipe (SPI or I2C), `HardwareControl` the GPIO
//! and power lines around the controller. Both are implemented by the
//! platform; `MockBus` and `SimulatedController` implement them for tests.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Line control failed: {0}")]
    LineControl(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Spi,
    I2c,
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusType::Spi => write!(f, "SPI"),
            BusType::I2c => write!(f, "I2C"),
        }
    }
}

/// Raw bus interface.
///
/// Each call is one bus transaction. Chunking, framing and locking are
/// layered on top by `ChunkedTransport`.
pub trait TcmBus: Send + Sync {
    /// Fill `buf` entirely from the controller.
    fn read(&self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Send `data` to the controller in one transaction.
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    fn bus_type(&self) -> BusType;
}

/// Reset/attention/power lines.
pub trait HardwareControl: Send + Sync {
    /// Whether a reset GPIO is wired up.
    fn has_reset_line(&self) -> bool {
        true
    }

    /// Drive the reset line; `true` holds the controller in reset.
    fn set_reset(&self, active: bool) -> Result<(), TransportError>;

    /// Switch the controller supplies.
    fn set_power(&self, on: bool) -> Result<(), TransportError>;

    /// Whether an interrupt can be installed for the attention line.
    fn irq_available(&self) -> bool;

    /// Attention line currently asserted.
    fn attention_asserted(&self) -> bool;
}
