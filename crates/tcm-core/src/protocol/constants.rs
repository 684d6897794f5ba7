//! Protocol constants for the Synaptics TouchComm (TCM) wire format.

// ============================================================================
// Framing
// ============================================================================

/// First byte of every message and every continuation chunk.
pub const MESSAGE_MARKER: u8 = 0xA5;

/// Trailing byte of every fully assembled message.
pub const MESSAGE_PADDING: u8 = 0xFF;

/// `[marker][code][length_lo][length_hi]`
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Marker byte plus code byte at the head of each read chunk.
pub const READ_CHUNK_OVERHEAD: usize = 2;

/// Command (or continue-write) byte at the head of each write chunk.
pub const WRITE_CHUNK_OVERHEAD: usize = 1;

/// Smallest read issued for a new message when predictive reading is on.
pub const MIN_READ_LENGTH: usize = 9;

/// ROM-boot download payloads must be aligned to this unit.
pub const ROMBOOT_DOWNLOAD_UNIT: usize = 16;

// ============================================================================
// Commands (Host -> Device)
// ============================================================================

pub const CMD_NONE: u8 = 0x00;
pub const CMD_CONTINUE_WRITE: u8 = 0x01;
pub const CMD_IDENTIFY: u8 = 0x02;
pub const CMD_RESET: u8 = 0x04;
pub const CMD_ENABLE_REPORT: u8 = 0x05;
pub const CMD_DISABLE_REPORT: u8 = 0x06;
pub const CMD_GET_BOOT_INFO: u8 = 0x10;
pub const CMD_ERASE_FLASH: u8 = 0x11;
pub const CMD_WRITE_FLASH: u8 = 0x12;
pub const CMD_READ_FLASH: u8 = 0x13;
pub const CMD_RUN_APPLICATION_FIRMWARE: u8 = 0x14;
pub const CMD_SPI_MASTER_WRITE_THEN_READ: u8 = 0x15;
pub const CMD_REBOOT_TO_ROM_BOOTLOADER: u8 = 0x16;
pub const CMD_RUN_BOOTLOADER_FIRMWARE: u8 = 0x1F;
pub const CMD_GET_APPLICATION_INFO: u8 = 0x20;
pub const CMD_GET_STATIC_CONFIG: u8 = 0x21;
pub const CMD_SET_STATIC_CONFIG: u8 = 0x22;
pub const CMD_GET_DYNAMIC_CONFIG: u8 = 0x23;
pub const CMD_SET_DYNAMIC_CONFIG: u8 = 0x24;
pub const CMD_GET_TOUCH_REPORT_CONFIG: u8 = 0x25;
pub const CMD_SET_TOUCH_REPORT_CONFIG: u8 = 0x26;
pub const CMD_REZERO: u8 = 0x27;
pub const CMD_COMMIT_CONFIG: u8 = 0x28;
pub const CMD_DESCRIBE_DYNAMIC_CONFIG: u8 = 0x29;
pub const CMD_PRODUCTION_TEST: u8 = 0x2A;
pub const CMD_SET_CONFIG_ID: u8 = 0x2B;
pub const CMD_ENTER_DEEP_SLEEP: u8 = 0x2C;
pub const CMD_EXIT_DEEP_SLEEP: u8 = 0x2D;
pub const CMD_GET_TOUCH_INFO: u8 = 0x2E;
pub const CMD_GET_DATA_LOCATION: u8 = 0x2F;
pub const CMD_DOWNLOAD_CONFIG: u8 = 0x30;
pub const CMD_ENTER_PRODUCTION_TEST_MODE: u8 = 0x31;
pub const CMD_GET_FEATURES: u8 = 0x32;
pub const CMD_GET_ROMBOOT_INFO: u8 = 0x40;
pub const CMD_WRITE_PROGRAM_RAM: u8 = 0x41;
pub const CMD_ROMBOOT_RUN_BOOTLOADER_FIRMWARE: u8 = 0x42;
pub const CMD_SPI_MASTER_WRITE_THEN_READ_EXTENDED: u8 = 0x43;
pub const CMD_ENTER_IO_BRIDGE_MODE: u8 = 0x44;
pub const CMD_ROMBOOT_DOWNLOAD: u8 = 0x45;

/// Commands whose completion is signalled by an identify report rather than
/// a regular response.
pub const MODE_TRANSITION_COMMANDS: &[u8] = &[
    CMD_RESET,
    CMD_RUN_BOOTLOADER_FIRMWARE,
    CMD_RUN_APPLICATION_FIRMWARE,
    CMD_ENTER_PRODUCTION_TEST_MODE,
    CMD_ROMBOOT_RUN_BOOTLOADER_FIRMWARE,
];

// ============================================================================
// Status codes (Device -> Host, responses)
// ============================================================================

pub const STATUS_IDLE: u8 = 0x00;
pub const STATUS_OK: u8 = 0x01;
pub const STATUS_BUSY: u8 = 0x02;
pub const STATUS_CONTINUED_READ: u8 = 0x03;
pub const STATUS_NOT_EXECUTED_IN_DEEP_SLEEP: u8 = 0x0B;
pub const STATUS_RECEIVE_BUFFER_OVERFLOW: u8 = 0x0C;
pub const STATUS_PREVIOUS_COMMAND_PENDING: u8 = 0x0D;
pub const STATUS_NOT_IMPLEMENTED: u8 = 0x0E;
pub const STATUS_ERROR: u8 = 0x0F;
pub const STATUS_INVALID: u8 = 0xFF;

// ============================================================================
// Report codes (Device -> Host, unsolicited)
// ============================================================================

/// Lowest report code; everything at or above is a report.
pub const REPORT_IDENTIFY: u8 = 0x10;
pub const REPORT_TOUCH: u8 = 0x11;
pub const REPORT_DELTA: u8 = 0x12;
pub const REPORT_RAW: u8 = 0x13;
pub const REPORT_STATUS: u8 = 0x1B;
pub const REPORT_PRINTF: u8 = 0x82;
/// Synthetic report id used to trigger a host download from the ROM boot.
pub const REPORT_HDL_ROMBOOT: u8 = 0xFD;
/// Synthetic report id used to trigger a host download through F35.
pub const REPORT_HDL_F35: u8 = 0xFE;

// ============================================================================
// Firmware modes (identify report)
// ============================================================================

pub const MODE_APPLICATION_FIRMWARE: u8 = 0x01;
pub const MODE_HOSTDOWNLOAD_FIRMWARE: u8 = 0x02;
pub const MODE_ROMBOOTLOADER: u8 = 0x04;
pub const MODE_BOOTLOADER: u8 = 0x0B;
pub const MODE_TDDI_BOOTLOADER: u8 = 0x0C;
pub const MODE_TDDI_HOSTDOWNLOAD_BOOTLOADER: u8 = 0x0D;
pub const MODE_PRODUCTIONTEST_FIRMWARE: u8 = 0x0E;

// ============================================================================
// Application status (application info)
// ============================================================================

pub const APP_STATUS_OK: u16 = 0x00;
pub const APP_STATUS_BOOTING: u16 = 0x01;
pub const APP_STATUS_UPDATING: u16 = 0x02;
pub const APP_STATUS_BAD_APP_CONFIG: u16 = 0xFF;

// ============================================================================
// Data location areas (GET_DATA_LOCATION argument)
// ============================================================================

pub const LCM_DATA: u8 = 0x01;
pub const OEM_DATA: u8 = 0x02;
pub const PPDT_DATA: u8 = 0x03;

// ============================================================================
// Timing defaults (milliseconds unless noted)
// ============================================================================

pub const RESPONSE_TIMEOUT_MS: u64 = 3000;
pub const APP_STATUS_POLL_TIMEOUT_MS: u64 = 1000;
pub const APP_STATUS_POLL_MS: u64 = 100;
pub const ENABLE_IRQ_DELAY_MS: u64 = 20;
pub const POLLING_DELAY_MS: u64 = 5;
pub const MODE_SWITCH_DELAY_MS: u64 = 100;
pub const READ_RETRY_US_MIN: u64 = 5000;
pub const READ_RETRY_US_MAX: u64 = 10000;
pub const WRITE_DELAY_US_MIN: u64 = 500;
pub const WRITE_DELAY_US_MAX: u64 = 1000;
pub const HOST_DOWNLOAD_WAIT_MS: u64 = 100;
pub const HOST_DOWNLOAD_TIMEOUT_MS: u64 = 5000;
pub const WATCHDOG_DELAY_MS: u64 = 1000;
pub const WATCHDOG_TRIGGER_COUNT: u32 = 2;
pub const RESET_ACTIVE_MS: u64 = 20;
pub const RESET_DELAY_MS: u64 = 200;
pub const WAIT_MODULE_INITIALIZED_MS: u64 = 5;
pub const WAIT_MODULE_INITIALIZED_MAX_MS: u64 = 500;
pub const RESUME_SLEEP_EXIT_RETRIES: u32 = 5;
pub const RESUME_SLEEP_EXIT_DELAY_MS: u64 = 5;

/// Chunk sizes used while the controller runs the ROM bootloader.
pub const HDL_RD_CHUNK_SIZE: usize = 256;
pub const HDL_WR_CHUNK_SIZE: usize = 1024;
