//! Device identity as learned from identify exchanges.

use std::fmt;

use crate::protocol::{AppInfo, BootInfo, FirmwareMode, IdentifyInfo, RomBootInfo};

/// How the controller was found at probe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SensorType {
    #[default]
    Unknown,
    /// Application firmware running from flash.
    Flash,
    /// ROM bootloader waiting for a host download.
    RomBoot,
    /// Not speaking TCM; reachable only through the F35 recovery path.
    F35,
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Unknown => write!(f, "UNKNOWN"),
            SensorType::Flash => write!(f, "FLASH"),
            SensorType::RomBoot => write!(f, "ROMBOOT"),
            SensorType::F35 => write!(f, "F35"),
        }
    }
}

/// Feature descriptor returned by GET_FEATURES.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub raw: Vec<u8>,
}

impl Features {
    /// Bit `bit` of the descriptor, counting from byte 0 LSB.
    pub fn bit(&self, bit: usize) -> bool {
        self.raw
            .get(bit / 8)
            .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceIdentity {
    pub id_info: IdentifyInfo,
    /// Firmware build id, as printed on release packages.
    pub packrat_number: u32,
    pub app_info: Option<AppInfo>,
    pub boot_info: Option<BootInfo>,
    pub romboot_info: Option<RomBootInfo>,
    pub features: Features,
    pub sensor_type: SensorType,
    pub is_detected: bool,
}

impl DeviceIdentity {
    pub fn mode(&self) -> FirmwareMode {
        self.id_info.mode
    }

    pub fn max_write_size(&self) -> u16 {
        self.id_info.max_write_size
    }

    /// Application status from the last application info query.
    pub fn app_status(&self) -> Option<u16> {
        self.app_info.as_ref().map(|info| info.status)
    }

    /// Adopt a freshly decoded identify block.
    ///
    /// Returns the previous mode when it changed.
    pub fn update(&mut self, info: IdentifyInfo) -> Option<FirmwareMode> {
        let previous = self.id_info.mode;
        self.packrat_number = info.build_id;
        self.id_info = info;
        (previous != self.id_info.mode).then_some(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_mode_change() {
        let mut identity = DeviceIdentity::default();
        let info = IdentifyInfo {
            mode: FirmwareMode::Bootloader,
            build_id: 1234,
            ..Default::default()
        };
        assert_eq!(identity.update(info.clone()), Some(FirmwareMode::Unidentified));
        assert_eq!(identity.update(info), None);
        assert_eq!(identity.packrat_number, 1234);
        assert_eq!(identity.mode(), FirmwareMode::Bootloader);
    }

    #[test]
    fn test_feature_bits() {
        let features = Features {
            raw: vec![0b0000_0100, 0b1000_0000],
        };
        assert!(features.bit(2));
        assert!(features.bit(15));
        assert!(!features.bit(0));
        assert!(!features.bit(40));
    }

    #[test]
    fn test_app_status() {
        let mut identity = DeviceIdentity::default();
        assert_eq!(identity.app_status(), None);
        identity.app_info = Some(AppInfo {
            status: 2,
            ..Default::default()
        });
        assert_eq!(identity.app_status(), Some(2));
    }
}
