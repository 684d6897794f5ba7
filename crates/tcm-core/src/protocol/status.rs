//! Status/report code classification and firmware modes.
//!
//! Every inbound message carries one code byte. Low codes are control
//! statuses, codes from `REPORT_IDENTIFY` upward are unsolicited reports.

use std::fmt;

use super::constants::*;

/// Code byte of an inbound message.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u8);

impl StatusCode {
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Control statuses: everything up to `STATUS_ERROR`, plus `STATUS_INVALID`.
    pub fn is_control(&self) -> bool {
        self.0 <= STATUS_ERROR || self.0 == STATUS_INVALID
    }

    /// Reports are routed to modules, never to a pending command.
    pub fn is_report(&self) -> bool {
        self.0 >= REPORT_IDENTIFY && self.0 != STATUS_INVALID
    }

    /// Codes that never carry a payload worth dispatching.
    pub fn is_payloadless(&self) -> bool {
        matches!(self.0, STATUS_IDLE | STATUS_BUSY | STATUS_CONTINUED_READ)
    }

    pub fn is_ok(&self) -> bool {
        self.0 == STATUS_OK
    }

    pub fn name(&self) -> &'static str {
        match self.0 {
            STATUS_IDLE => "IDLE",
            STATUS_OK => "OK",
            STATUS_BUSY => "BUSY",
            STATUS_CONTINUED_READ => "CONTINUED_READ",
            STATUS_NOT_EXECUTED_IN_DEEP_SLEEP => "NOT_EXECUTED_IN_DEEP_SLEEP",
            STATUS_RECEIVE_BUFFER_OVERFLOW => "RECEIVE_BUFFER_OVERFLOW",
            STATUS_PREVIOUS_COMMAND_PENDING => "PREVIOUS_COMMAND_PENDING",
            STATUS_NOT_IMPLEMENTED => "NOT_IMPLEMENTED",
            STATUS_ERROR => "ERROR",
            STATUS_INVALID => "INVALID",
            REPORT_IDENTIFY => "REPORT_IDENTIFY",
            REPORT_TOUCH => "REPORT_TOUCH",
            REPORT_DELTA => "REPORT_DELTA",
            REPORT_RAW => "REPORT_RAW",
            REPORT_STATUS => "REPORT_STATUS",
            REPORT_PRINTF => "REPORT_PRINTF",
            REPORT_HDL_ROMBOOT => "REPORT_HDL_ROMBOOT",
            REPORT_HDL_F35 => "REPORT_HDL_F35",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode(0x{:02X} {})", self.0, self.name())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

/// Firmware mode announced in the identify report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirmwareMode {
    Application,
    HostDownloadFirmware,
    RomBootloader,
    Bootloader,
    TddiBootloader,
    ProductionTest,
    Unknown(u8),
    /// No identify report seen yet.
    #[default]
    Unidentified,
}

impl FirmwareMode {
    pub fn from_code(code: u8) -> Self {
        match code {
            MODE_APPLICATION_FIRMWARE => Self::Application,
            MODE_HOSTDOWNLOAD_FIRMWARE => Self::HostDownloadFirmware,
            MODE_ROMBOOTLOADER => Self::RomBootloader,
            MODE_BOOTLOADER => Self::Bootloader,
            MODE_TDDI_BOOTLOADER => Self::TddiBootloader,
            MODE_PRODUCTIONTEST_FIRMWARE => Self::ProductionTest,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Application => MODE_APPLICATION_FIRMWARE,
            Self::HostDownloadFirmware => MODE_HOSTDOWNLOAD_FIRMWARE,
            Self::RomBootloader => MODE_ROMBOOTLOADER,
            Self::Bootloader => MODE_BOOTLOADER,
            Self::TddiBootloader => MODE_TDDI_BOOTLOADER,
            Self::ProductionTest => MODE_PRODUCTIONTEST_FIRMWARE,
            Self::Unknown(code) => *code,
            Self::Unidentified => 0x00,
        }
    }

    /// Application firmware (flash or host-downloaded) is running.
    pub fn is_firmware(&self) -> bool {
        matches!(self, Self::Application | Self::HostDownloadFirmware)
    }

    pub fn is_bootloader(&self) -> bool {
        matches!(self, Self::Bootloader | Self::TddiBootloader)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "APPLICATION"),
            Self::HostDownloadFirmware => write!(f, "HOST_DOWNLOAD"),
            Self::RomBootloader => write!(f, "ROM_BOOTLOADER"),
            Self::Bootloader => write!(f, "BOOTLOADER"),
            Self::TddiBootloader => write!(f, "TDDI_BOOTLOADER"),
            Self::ProductionTest => write!(f, "PRODUCTION_TEST"),
            Self::Unknown(code) => write!(f, "UNKNOWN(0x{code:02X})"),
            Self::Unidentified => write!(f, "UNIDENTIFIED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_classes() {
        assert!(StatusCode(STATUS_OK).is_control());
        assert!(StatusCode(STATUS_INVALID).is_control());
        assert!(!StatusCode(STATUS_INVALID).is_report());
        assert!(StatusCode(REPORT_IDENTIFY).is_report());
        assert!(StatusCode(REPORT_TOUCH).is_report());
        assert!(!StatusCode(STATUS_ERROR).is_report());
    }

    #[test]
    fn test_payloadless_statuses() {
        assert!(StatusCode(STATUS_IDLE).is_payloadless());
        assert!(StatusCode(STATUS_BUSY).is_payloadless());
        assert!(StatusCode(STATUS_CONTINUED_READ).is_payloadless());
        assert!(!StatusCode(STATUS_OK).is_payloadless());
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(FirmwareMode::from_code(0x01), FirmwareMode::Application);
        assert_eq!(FirmwareMode::from_code(0x0E), FirmwareMode::ProductionTest);
        assert_eq!(FirmwareMode::from_code(0x77), FirmwareMode::Unknown(0x77));
        assert_eq!(FirmwareMode::Bootloader.code(), MODE_BOOTLOADER);
        assert!(FirmwareMode::HostDownloadFirmware.is_firmware());
        assert!(!FirmwareMode::RomBootloader.is_firmware());
    }
}
