//! Protocol module - TouchComm wire definitions.

pub mod constants;
pub mod dynamic;
pub mod header;
pub mod status;

pub use constants::*;
pub use dynamic::{DataLocation, DynamicConfigId, FlashArea};
pub use header::{AppInfo, BootInfo, HeaderError, IdentifyInfo, MessageHeader, RomBootInfo};
pub use status::{FirmwareMode, StatusCode};
