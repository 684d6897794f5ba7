//! Dynamic configuration entries and flash data areas.

use std::fmt;

use super::constants::*;

/// Entry of the dynamic configuration table (GET/SET_DYNAMIC_CONFIG).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicConfigId(pub u8);

impl DynamicConfigId {
    pub const NO_DOZE: Self = Self(0x01);
    pub const DISABLE_NOISE_MITIGATION: Self = Self(0x02);
    pub const INHIBIT_FREQUENCY_SHIFT: Self = Self(0x03);
    pub const REQUESTED_FREQUENCY: Self = Self(0x04);
    pub const DISABLE_HSYNC: Self = Self(0x05);
    pub const REZERO_ON_EXIT_DEEP_SLEEP: Self = Self(0x06);
    pub const CHARGER_CONNECTED: Self = Self(0x07);
    pub const NO_BASELINE_RELAXATION: Self = Self(0x08);
    pub const IN_WAKEUP_GESTURE_MODE: Self = Self(0x09);
    pub const STIMULUS_FINGERS: Self = Self(0x0A);
    pub const GRIP_SUPPRESSION_ENABLED: Self = Self(0x0B);
    pub const ENABLE_THICK_GLOVE: Self = Self(0x0C);
    pub const ENABLE_GLOVE: Self = Self(0x0D);
    /// Vendor extension: bitmask of enabled wakeup gestures.
    pub const GESTURE_TYPE_ENABLE: Self = Self(0xFE);

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::NO_DOZE => "NO_DOZE",
            Self::DISABLE_NOISE_MITIGATION => "DISABLE_NOISE_MITIGATION",
            Self::INHIBIT_FREQUENCY_SHIFT => "INHIBIT_FREQUENCY_SHIFT",
            Self::REQUESTED_FREQUENCY => "REQUESTED_FREQUENCY",
            Self::DISABLE_HSYNC => "DISABLE_HSYNC",
            Self::REZERO_ON_EXIT_DEEP_SLEEP => "REZERO_ON_EXIT_DEEP_SLEEP",
            Self::CHARGER_CONNECTED => "CHARGER_CONNECTED",
            Self::NO_BASELINE_RELAXATION => "NO_BASELINE_RELAXATION",
            Self::IN_WAKEUP_GESTURE_MODE => "IN_WAKEUP_GESTURE_MODE",
            Self::STIMULUS_FINGERS => "STIMULUS_FINGERS",
            Self::GRIP_SUPPRESSION_ENABLED => "GRIP_SUPPRESSION_ENABLED",
            Self::ENABLE_THICK_GLOVE => "ENABLE_THICK_GLOVE",
            Self::ENABLE_GLOVE => "ENABLE_GLOVE",
            Self::GESTURE_TYPE_ENABLE => "GESTURE_TYPE_ENABLE",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for DynamicConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamicConfigId(0x{:02X} {})", self.0, self.name())
    }
}

impl fmt::Display for DynamicConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Customer data areas reachable through GET_DATA_LOCATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashArea {
    CustomLcm,
    CustomOem,
    Ppdt,
}

impl FlashArea {
    pub fn code(&self) -> u8 {
        match self {
            FlashArea::CustomLcm => LCM_DATA,
            FlashArea::CustomOem => OEM_DATA,
            FlashArea::Ppdt => PPDT_DATA,
        }
    }
}

impl fmt::Display for FlashArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashArea::CustomLcm => write!(f, "LCM"),
            FlashArea::CustomOem => write!(f, "OEM"),
            FlashArea::Ppdt => write!(f, "PPDT"),
        }
    }
}

/// Address and size of a flash data area, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocation {
    pub addr: u16,
    pub length: u16,
}
