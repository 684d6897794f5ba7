//! TCM-Core: Synaptics TouchComm (TCM) controller driver core in Rust.
//!
//! This crate implements the host side of the TouchComm protocol: framed
//! command/response exchanges over a chunked SPI or I2C bus, report dispatch
//! to touch and auxiliary modules, firmware mode transitions, recovery and
//! power management.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, status codes, message and info block layouts
//! - **Transport**: Bus abstraction, chunked transfers, simulator and mock
//! - **Framer**: Message reads with continued-read reassembly
//! - **Command**: Single-slot command engine with response timeouts
//! - **State**: Device identity and firmware mode transitions
//! - **Registry**: Auxiliary modules (testing, reflash, host download)
//! - **Events**: Observer pattern for logging and test hooks
//! - **Device**: Public handle, background workers and power management
//! - **Broker**: Wakeup gesture routing between userspace and panels
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcm_core::{DriverConfig, SimulatedController, TcmDevice};
//!
//! let sim = Arc::new(SimulatedController::new());
//! let device = TcmDevice::new(sim, DriverConfig::default());
//! device.probe().expect("probe failed");
//! println!("{}", device.identity().mode());
//! ```

pub mod backoff;
pub mod broker;
pub mod command;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod framer;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod transport;
pub mod worker;

mod power;
mod tasks;

// Re-exports for convenience
pub use broker::{OneshotSensor, TouchId, TouchMode, TouchModeBroker, TouchModeClient};
pub use command::{CommandState, Response};
pub use config::DriverConfig;
pub use device::{GestureState, HelperTask, TcmDevice};
pub use dispatch::{Report, TouchReportHandler};
pub use error::{Result, TcmError};
pub use events::{LogLevel, NullObserver, TcmEvent, TcmObserver, TracingObserver};
pub use protocol::{DataLocation, DynamicConfigId, FirmwareMode, FlashArea, StatusCode};
pub use registry::{ModuleRegistry, ModuleType, TcmModule};
pub use state::{DeviceIdentity, Features, SensorType};
pub use transport::{
    BusType, HardwareControl, MockBus, SimulatedController, TcmBus, TransportError,
};
