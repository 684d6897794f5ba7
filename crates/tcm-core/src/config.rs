//! Driver tunables.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::protocol::constants::*;

/// Configuration for a TCM driver instance.
///
/// Defaults match the production driver. Tests shrink the delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Read chunk size in bytes (0 = single transfer).
    pub rd_chunk_size: usize,
    /// Write chunk size in bytes (0 = single transfer).
    pub wr_chunk_size: usize,
    /// Chunk sizes while host download is in progress.
    pub hdl_rd_chunk_size: usize,
    pub hdl_wr_chunk_size: usize,
    /// Size reads to the next expected message.
    pub predictive_reading: bool,

    pub response_timeout_ms: u64,
    pub polling_delay_ms: u64,
    pub mode_switch_delay_ms: u64,
    pub reset_active_ms: u64,
    pub reset_delay_ms: u64,
    pub app_status_poll_ms: u64,
    pub app_status_poll_timeout_ms: u64,
    pub read_retry_us_min: u64,
    pub read_retry_us_max: u64,
    pub write_delay_us_min: u64,
    pub write_delay_us_max: u64,
    /// Immediate re-reads after a bad header marker.
    pub framing_retries: u32,
    pub enable_irq_delay_ms: u64,

    pub watchdog_enabled: bool,
    pub watchdog_delay_ms: u64,
    pub watchdog_trigger_count: u32,

    pub host_download_wait_ms: u64,
    pub host_download_timeout_ms: u64,

    pub report_notifier: bool,
    pub registry_init_wait_ms: u64,
    pub registry_init_max_ms: u64,

    pub resume_sleep_exit_retries: u32,
    pub resume_sleep_exit_delay_ms: u64,

    /// Keep wakeup gestures armed through suspend when any is requested.
    pub wakeup_gesture: bool,
    /// Leave any non-firmware mode announced by an identify report.
    pub force_run_application_firmware: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            rd_chunk_size: 0,
            wr_chunk_size: 0,
            hdl_rd_chunk_size: HDL_RD_CHUNK_SIZE,
            hdl_wr_chunk_size: HDL_WR_CHUNK_SIZE,
            predictive_reading: true,
            response_timeout_ms: RESPONSE_TIMEOUT_MS,
            polling_delay_ms: POLLING_DELAY_MS,
            mode_switch_delay_ms: MODE_SWITCH_DELAY_MS,
            reset_active_ms: RESET_ACTIVE_MS,
            reset_delay_ms: RESET_DELAY_MS,
            app_status_poll_ms: APP_STATUS_POLL_MS,
            app_status_poll_timeout_ms: APP_STATUS_POLL_TIMEOUT_MS,
            read_retry_us_min: READ_RETRY_US_MIN,
            read_retry_us_max: READ_RETRY_US_MAX,
            write_delay_us_min: WRITE_DELAY_US_MIN,
            write_delay_us_max: WRITE_DELAY_US_MAX,
            framing_retries: 1,
            enable_irq_delay_ms: ENABLE_IRQ_DELAY_MS,
            watchdog_enabled: true,
            watchdog_delay_ms: WATCHDOG_DELAY_MS,
            watchdog_trigger_count: WATCHDOG_TRIGGER_COUNT,
            host_download_wait_ms: HOST_DOWNLOAD_WAIT_MS,
            host_download_timeout_ms: HOST_DOWNLOAD_TIMEOUT_MS,
            report_notifier: true,
            registry_init_wait_ms: WAIT_MODULE_INITIALIZED_MS,
            registry_init_max_ms: WAIT_MODULE_INITIALIZED_MAX_MS,
            resume_sleep_exit_retries: RESUME_SLEEP_EXIT_RETRIES,
            resume_sleep_exit_delay_ms: RESUME_SLEEP_EXIT_DELAY_MS,
            wakeup_gesture: true,
            force_run_application_firmware: false,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings that would leave no payload space in a chunk.
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("rd_chunk_size", self.rd_chunk_size),
            ("hdl_rd_chunk_size", self.hdl_rd_chunk_size),
        ] {
            if size != 0 && size <= READ_CHUNK_OVERHEAD {
                bail!("{name} must be 0 or greater than {READ_CHUNK_OVERHEAD}, got {size}");
            }
        }
        for (name, size) in [
            ("wr_chunk_size", self.wr_chunk_size),
            ("hdl_wr_chunk_size", self.hdl_wr_chunk_size),
        ] {
            if size != 0 && size <= WRITE_CHUNK_OVERHEAD {
                bail!("{name} must be 0 or greater than {WRITE_CHUNK_OVERHEAD}, got {size}");
            }
        }
        if self.hdl_wr_chunk_size != 0 && self.hdl_wr_chunk_size <= ROMBOOT_DOWNLOAD_UNIT {
            bail!(
                "hdl_wr_chunk_size must exceed the ROM-boot download unit ({ROMBOOT_DOWNLOAD_UNIT})"
            );
        }
        if self.read_retry_us_min > self.read_retry_us_max {
            bail!("read_retry_us_min exceeds read_retry_us_max");
        }
        if self.write_delay_us_min > self.write_delay_us_max {
            bail!("write_delay_us_min exceeds write_delay_us_max");
        }
        if self.response_timeout_ms == 0 {
            bail!("response_timeout_ms must be non-zero");
        }
        if self.polling_delay_ms == 0 {
            bail!("polling_delay_ms must be non-zero");
        }
        Ok(())
    }

    /// Near-zero delays for driving the simulated controller in tests.
    pub fn fast() -> Self {
        Self {
            polling_delay_ms: 1,
            mode_switch_delay_ms: 1,
            reset_active_ms: 1,
            reset_delay_ms: 20,
            app_status_poll_ms: 2,
            app_status_poll_timeout_ms: 20,
            read_retry_us_min: 10,
            read_retry_us_max: 50,
            write_delay_us_min: 0,
            write_delay_us_max: 0,
            enable_irq_delay_ms: 0,
            response_timeout_ms: 1000,
            watchdog_enabled: false,
            watchdog_delay_ms: 20,
            host_download_wait_ms: 1,
            host_download_timeout_ms: 100,
            resume_sleep_exit_delay_ms: 1,
            ..Self::default()
        }
    }
}
