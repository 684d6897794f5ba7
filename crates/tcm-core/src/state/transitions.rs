//! Identify exchanges and firmware mode transitions.
//!
//! Every transition is a command followed by a check of the identify block
//! the controller sent back. A transition that does not land in the expected
//! mode is retried once before `ModeTransitionFailed` is surfaced.

use std::sync::MutexGuard;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::machine::Features;
use crate::device::{Core, lock};
use crate::error::{Result, TcmError};
use crate::events::TcmEvent;
use crate::protocol::constants::*;
use crate::protocol::{AppInfo, BootInfo, FirmwareMode, IdentifyInfo, RomBootInfo};

impl Core {
    fn mode_switch_delay(&self) -> Duration {
        Duration::from_millis(self.config.mode_switch_delay_ms)
    }

    /// Store a decoded identify block and announce a mode change.
    pub(crate) fn adopt_identify(&self, info: IdentifyInfo) {
        let to = info.mode;
        if let Some(from) = self.update_identity(|identity| identity.update(info)) {
            self.observer.on_event(&TcmEvent::ModeChanged { from, to });
        }
    }

    /// Write chunk size after the controller announced `max_write`.
    ///
    /// Zero on either side means no bound from that side.
    pub(crate) fn negotiated_wr_chunk(&self, max_write: u16) -> usize {
        match (self.config.wr_chunk_size, max_write as usize) {
            (0, device) => device,
            (host, 0) => host,
            (host, device) => host.min(device),
        }
    }

    /// Refresh the identity, optionally sending IDENTIFY first, then fetch the
    /// info block that goes with the current mode.
    #[instrument(level = "debug", skip(self))]
    pub(crate) fn identify(&self, send: bool) -> Result<()> {
        let _identify = lock(&self.identify_lock);

        if send {
            let response = self.engine.request(CMD_IDENTIFY, &[])?;
            let info = self.identity().id_info.overlay(&response.payload)?;
            let max_write = info.max_write_size;
            let build_id = info.build_id;
            self.adopt_identify(info);
            self.transport
                .set_wr_chunk_size(self.negotiated_wr_chunk(max_write));
            info!(build_id, "Firmware build id");
        }

        let mode = self.mode();
        debug!(mode = %mode, "Identified");
        match mode {
            FirmwareMode::Application | FirmwareMode::HostDownloadFirmware => {
                self.get_app_info()
            }
            FirmwareMode::Bootloader | FirmwareMode::TddiBootloader => self.get_boot_info(),
            FirmwareMode::RomBootloader => self.get_romboot_info(),
            _ => Ok(()),
        }
    }

    /// GET_APPLICATION_INFO, repeated while the application is still booting
    /// or updating and the poll budget lasts.
    fn get_app_info(&self) -> Result<()> {
        let step = self.config.app_status_poll_ms;
        let mut budget = self.config.app_status_poll_timeout_ms;

        loop {
            let response = self.engine.request(CMD_GET_APPLICATION_INFO, &[])?;
            let app_info = AppInfo::from_bytes(&response.payload)?;
            let status = app_info.status;
            self.update_identity(|identity| identity.app_info = Some(app_info));

            if matches!(status, APP_STATUS_BOOTING | APP_STATUS_UPDATING) && budget > 0 {
                debug!(status, "Application not ready");
                thread::sleep(Duration::from_millis(step));
                budget = budget.saturating_sub(step);
                continue;
            }
            return Ok(());
        }
    }

    fn get_boot_info(&self) -> Result<()> {
        let response = self.engine.request(CMD_GET_BOOT_INFO, &[])?;
        let boot_info = BootInfo::from_bytes(&response.payload)?;
        self.update_identity(|identity| identity.boot_info = Some(boot_info));
        Ok(())
    }

    fn get_romboot_info(&self) -> Result<()> {
        let response = self.engine.request(CMD_GET_ROMBOOT_INFO, &[])?;
        let romboot_info = RomBootInfo::from_bytes(&response.payload)?;
        self.update_identity(|identity| identity.romboot_info = Some(romboot_info));
        Ok(())
    }

    fn log_app_status(&self) {
        if let Some(status) = self.identity().app_status()
            && status != APP_STATUS_OK
        {
            warn!(status = %format!("0x{:02X}", status), "Application status");
        }
    }

    pub(crate) fn run_application_firmware(&self) -> Result<()> {
        let mut retried = false;
        loop {
            self.engine.request_with_delay(
                CMD_RUN_APPLICATION_FIRMWARE,
                &[],
                self.mode_switch_delay(),
            )?;
            self.identify(false)?;

            let identity = self.identity();
            let mode = identity.mode();
            if mode.is_firmware() {
                self.log_app_status();
                return Ok(());
            }

            warn!(
                mode = %mode,
                boot_status = identity.boot_info.as_ref().map(|b| b.status),
                "Failed to run application firmware"
            );
            if retried {
                return Err(TcmError::ModeTransitionFailed {
                    expected: FirmwareMode::Application.to_string(),
                    actual: mode.to_string(),
                });
            }
            retried = true;
        }
    }

    /// From the ROM bootloader the switch is not followed by an identify
    /// check; the ROM answers before the bootloader is up.
    pub(crate) fn run_bootloader_firmware(&self) -> Result<()> {
        let mut retried = false;
        loop {
            let from_romboot = self.mode() == FirmwareMode::RomBootloader;
            let command = if from_romboot {
                CMD_ROMBOOT_RUN_BOOTLOADER_FIRMWARE
            } else {
                CMD_RUN_BOOTLOADER_FIRMWARE
            };
            self.engine
                .request_with_delay(command, &[], self.mode_switch_delay())?;
            if from_romboot {
                return Ok(());
            }

            self.identify(false)?;
            let mode = self.mode();
            if !mode.is_firmware() {
                return Ok(());
            }

            warn!(mode = %mode, "Failed to enter bootloader mode");
            if retried {
                return Err(TcmError::ModeTransitionFailed {
                    expected: FirmwareMode::Bootloader.to_string(),
                    actual: mode.to_string(),
                });
            }
            retried = true;
        }
    }

    pub(crate) fn run_production_test_firmware(&self) -> Result<()> {
        let mut retried = false;
        loop {
            self.engine.request_with_delay(
                CMD_ENTER_PRODUCTION_TEST_MODE,
                &[],
                self.mode_switch_delay(),
            )?;

            let mode = self.mode();
            if mode == FirmwareMode::ProductionTest {
                self.log_app_status();
                return Ok(());
            }

            warn!(mode = %mode, "Failed to run production test firmware");
            if retried {
                return Err(TcmError::ModeTransitionFailed {
                    expected: FirmwareMode::ProductionTest.to_string(),
                    actual: mode.to_string(),
                });
            }
            retried = true;
        }
    }

    /// Switch to `target` with the watchdog paused.
    #[instrument(level = "debug", skip(self))]
    pub(crate) fn switch_mode(&self, target: FirmwareMode) -> Result<()> {
        let _reset = lock(&self.reset_lock);
        self.update_watchdog(false);

        let result = match target {
            FirmwareMode::Bootloader => self.run_bootloader_firmware(),
            FirmwareMode::Application => self.run_application_firmware(),
            FirmwareMode::ProductionTest => self.run_production_test_firmware(),
            other => Err(TcmError::InvalidArgument(format!(
                "cannot switch to {other}"
            ))),
        };
        if let Err(e) = &result {
            warn!(target = %target, error = %e, "Failed to switch mode");
        }

        self.update_watchdog(true);
        result
    }

    pub(crate) fn reset_and_reinit(&self, hardware: bool, update_wd: bool) -> Result<()> {
        let guard = lock(&self.reset_lock);
        self.reset_and_reinit_locked(guard, hardware, update_wd)
    }

    /// Reset the controller and bring it back to application firmware.
    ///
    /// In host download mode the rest of the bring-up belongs to the download
    /// modules, so only the download completion is awaited, outside the reset
    /// lock.
    #[instrument(level = "debug", skip(self, reset_guard))]
    pub(crate) fn reset_and_reinit_locked(
        &self,
        reset_guard: MutexGuard<'_, ()>,
        hardware: bool,
        update_wd: bool,
    ) -> Result<()> {
        if update_wd {
            self.update_watchdog(false);
        }

        if let Err(e) = self.issue_reset(hardware) {
            warn!(hardware, error = %e, "Failed to reset");
            if update_wd {
                self.update_watchdog(true);
            }
            return Err(e);
        }
        self.observer.on_event(&TcmEvent::DeviceReset { hardware });

        if self.flags.in_hdl_mode() {
            drop(reset_guard);
            self.wait_host_download()?;
            if update_wd {
                self.update_watchdog(true);
            }
            return Ok(());
        }

        thread::sleep(Duration::from_millis(self.config.reset_delay_ms));
        let result = self.reinit_after_reset();

        if update_wd {
            self.update_watchdog(true);
        }
        drop(reset_guard);
        result
    }

    fn issue_reset(&self, hardware: bool) -> Result<()> {
        if hardware {
            let hw = self
                .hw
                .as_ref()
                .filter(|hw| hw.has_reset_line())
                .ok_or(TcmError::HardwareResetUnavailable)?;
            hw.set_reset(true)?;
            thread::sleep(Duration::from_millis(self.config.reset_active_ms));
            hw.set_reset(false)?;
            return Ok(());
        }

        self.engine.request_with_delay(
            CMD_RESET,
            &[],
            Duration::from_millis(self.config.reset_delay_ms),
        )?;
        Ok(())
    }

    fn reinit_after_reset(&self) -> Result<()> {
        self.identify(false)?;

        if !self.mode().is_firmware() {
            if let Err(e) = self.engine.request_with_delay(
                CMD_RUN_APPLICATION_FIRMWARE,
                &[],
                self.mode_switch_delay(),
            ) {
                info!(error = %e, "Failed to run application firmware");
            }
            self.identify(false)?;
        }

        let identity = self.identity();
        let mode = identity.mode();
        info!(mode = %mode, "Firmware mode");
        if !mode.is_firmware() {
            info!(boot_status = identity.boot_info.as_ref().map(|b| b.status), "Not in firmware mode");
        } else {
            self.log_app_status();
            if let Err(e) = self.get_features() {
                info!(error = %e, "Failed to get features");
            }
        }

        self.registry.reinit_all();
        Ok(())
    }

    pub(crate) fn get_features(&self) -> Result<Features> {
        let response = self.engine.request(CMD_GET_FEATURES, &[])?;
        let features = Features {
            raw: response.payload,
        };
        self.update_identity(|identity| identity.features = features.clone());
        Ok(features)
    }
}
