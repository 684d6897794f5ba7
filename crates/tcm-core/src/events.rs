//! Event system for front-end decoupling.
//!
//! Lets the CLI (or any other front-end) watch bus traffic, reports,
//! command completions and firmware mode changes without coupling to the
//! driver internals.

use std::fmt;

use crate::protocol::FirmwareMode;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Bus transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Controller
    Rx, // Controller -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by the driver core.
#[derive(Debug, Clone)]
pub enum TcmEvent {
    /// Firmware mode changed after an identify exchange or report.
    ModeChanged { from: FirmwareMode, to: FirmwareMode },
    /// Raw bus transfer.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// Report delivered to the touch handler or the module list.
    Report { id: u8, length: usize },
    /// Command completed with a response.
    CommandCompleted { command: u8, status: u8, length: usize },
    /// Command failed (timeout, reset, bus error...).
    CommandFailed { command: u8, message: String },
    /// Reset and reinit sequence ran.
    DeviceReset { hardware: bool },
    /// Host download started or finished.
    HostDownload { active: bool },
    /// Log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving driver events.
///
/// Implement this trait in your front-end to receive updates.
pub trait TcmObserver: Send + Sync {
    fn on_event(&self, event: &TcmEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl TcmObserver for NullObserver {
    fn on_event(&self, _event: &TcmEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl TcmObserver for TracingObserver {
    fn on_event(&self, event: &TcmEvent) {
        match event {
            TcmEvent::ModeChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Firmware mode changed");
            }
            TcmEvent::Packet {
                direction, length, ..
            } => {
                tracing::trace!(dir = %direction, len = length, "Bus packet");
            }
            TcmEvent::Report { id, length } => {
                tracing::debug!(id = %format!("0x{:02X}", id), len = length, "Report");
            }
            TcmEvent::CommandCompleted {
                command,
                status,
                length,
            } => {
                tracing::debug!(
                    command = %format!("0x{:02X}", command),
                    status = %format!("0x{:02X}", status),
                    len = length,
                    "Command completed"
                );
            }
            TcmEvent::CommandFailed { command, message } => {
                tracing::error!(command = %format!("0x{:02X}", command), "Command failed: {}", message);
            }
            TcmEvent::DeviceReset { hardware } => {
                tracing::info!(hardware = hardware, "Device reset");
            }
            TcmEvent::HostDownload { active } => {
                tracing::info!(active = active, "Host download");
            }
            TcmEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
