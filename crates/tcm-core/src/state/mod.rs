//! Device state: identity bookkeeping and firmware mode transitions.

pub mod machine;
mod transitions;

pub use machine::{DeviceIdentity, Features, SensorType};
