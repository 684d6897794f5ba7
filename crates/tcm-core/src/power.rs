//! Power management and wakeup gestures.
//!
//! The panel notifier drives `early_suspend` (screen going off), `suspend`
//! and `resume`. Whether the controller goes to deep sleep depends on the
//! gestures requested through the touch-mode broker.

use std::thread;

use tracing::{debug, error, info, warn};

use crate::broker::{TouchMode, TouchModeClient};
use crate::device::{Core, TcmDevice, lock, ms};
use crate::error::{Result, TcmError};
use crate::protocol::DynamicConfigId;

/// GESTURE_TYPE_ENABLE bit arming single tap.
const GESTURE_SINGLE_TAP: u16 = 1 << 13;

impl Core {
    pub(crate) fn early_suspend(&self) -> Result<()> {
        self.flags.set_panel_off(true);
        if self.flags.in_suspend() {
            debug!("Already suspended");
            return Ok(());
        }

        self.flags.set_in_suspending(true);
        self.update_watchdog(false);

        if !self.app_ready() {
            info!(mode = %self.mode(), "Not in application firmware, skipping sleep");
            self.flags.set_in_suspending(false);
            return Ok(());
        }

        let gestures = {
            let mut gestures = lock(&self.gestures);
            gestures.wakeup_enabled = self.config.wakeup_gesture && gestures.any_requested();
            *gestures
        };
        debug!(?gestures, "Early suspend");

        if !gestures.wakeup_enabled || gestures.nonui_status == 2 {
            if !self.flags.in_sleep() {
                if let Err(e) = self.sleep(true) {
                    self.flags.set_in_sleep(false);
                    self.flags.set_in_suspending(false);
                    error!(error = %e, "Failed to enter deep sleep");
                    return Err(e);
                }
                self.flags.set_in_sleep(true);
            }
        } else {
            debug!(nonui_status = gestures.nonui_status, "Keeping wakeup gestures armed");
        }

        if let Some(touch) = self.touch_handler() {
            touch.early_suspend();
        }
        self.registry.early_suspend_all();
        Ok(())
    }

    pub(crate) fn suspend(&self) {
        if self.flags.in_suspend() {
            return;
        }

        if let Some(touch) = self.touch_handler() {
            touch.suspend();
        }
        self.registry.suspend_all();

        if !lock(&self.gestures).wakeup_enabled {
            self.enable_irq(false);
        }

        self.flags.set_in_suspend(true);
        self.flags.set_in_suspending(false);
        info!("Suspended");
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.flags.set_panel_off(false);
        if !self.flags.in_suspend() {
            debug!("Already resumed");
            return Ok(());
        }
        self.flags.set_in_suspending(false);

        let result = self.resume_controller();
        self.flags.set_in_sleep(false);
        self.flags.set_in_suspend(false);

        if result.is_ok() {
            self.resend_charger_state();
            info!("Resumed");
        }
        result
    }

    fn resume_controller(&self) -> Result<()> {
        let wakeup = lock(&self.gestures).wakeup_enabled;

        if self.flags.in_hdl_mode() {
            if !wakeup {
                self.enable_irq(true);
                self.wait_host_download()?;
                self.resume_modules();
                return Ok(());
            }
        } else if !wakeup || self.flags.in_sleep() {
            self.enable_irq(true);
        }

        if !self.app_ready() {
            info!(mode = %self.mode(), "Resetting on resume");
            self.reset_and_reinit(false, true)?;
            if !self.app_ready() {
                warn!(mode = %self.mode(), "Still not in application firmware");
                return Ok(());
            }
            self.resume_modules();
            return Ok(());
        }

        self.exit_sleep_with_retries()?;

        let gestures = *lock(&self.gestures);
        if !(gestures.fod && gestures.fod_finger) {
            self.rezero()?;
        }

        self.resume_modules();
        Ok(())
    }

    fn exit_sleep_with_retries(&self) -> Result<()> {
        let mut result = self.sleep(false);
        for attempt in 0..self.config.resume_sleep_exit_retries {
            if result.is_ok() {
                break;
            }
            thread::sleep(ms(self.config.resume_sleep_exit_delay_ms));
            result = self.sleep(false);
            if let Err(e) = &result {
                warn!(attempt = attempt + 2, error = %e, "Failed to exit deep sleep");
            }
        }
        if let Err(e) = &result {
            error!(error = %e, "Failed to exit deep sleep, screen stays frozen");
        }
        result
    }

    fn resume_modules(&self) {
        if let Some(touch) = self.touch_handler() {
            touch.resume();
        }
        self.update_watchdog(true);
        self.registry.resume_all();
    }

    fn write_gesture_type(&self, gesture_type: u16) {
        lock(&self.gestures).gesture_type = gesture_type;
        if let Err(e) =
            self.set_dynamic_config(DynamicConfigId::GESTURE_TYPE_ENABLE, gesture_type)
        {
            error!(error = %e, "Failed to update gesture type");
        }
    }

    /// Pocket mode change while the panel is off. Failures are logged only.
    fn apply_nonui_status(&self, status: i32) {
        let gestures = *lock(&self.gestures);
        match status {
            0 => {
                if self.flags.in_sleep() {
                    info!("Exit sleep mode");
                    self.enable_irq(true);
                    if let Err(e) = self.sleep(false) {
                        self.flags.set_in_sleep(true);
                        error!(error = %e, "Failed to exit deep sleep");
                        return;
                    }
                    self.flags.set_in_sleep(false);
                }
                if gestures.fod || gestures.aod {
                    self.write_gesture_type(gestures.gesture_type | GESTURE_SINGLE_TAP);
                }
            }
            1 => {
                if gestures.fod && !gestures.aod && self.flags.in_suspend() {
                    self.write_gesture_type(gestures.gesture_type & !GESTURE_SINGLE_TAP);
                }
            }
            2 => {
                if !self.flags.in_sleep() && gestures.wakeup_enabled && self.flags.in_suspend() {
                    info!("Enter sleep mode");
                    if let Err(e) = self.sleep(true) {
                        self.flags.set_in_sleep(false);
                        error!(error = %e, "Failed to enter deep sleep");
                        return;
                    }
                    self.enable_irq(false);
                    self.flags.set_in_sleep(true);
                }
            }
            other => debug!(status = other, "Unknown non-UI status"),
        }
    }

    pub(crate) fn set_touch_mode(&self, mode: TouchMode, value: i32) -> Result<()> {
        debug!(?mode, value, "Set touch mode");
        match mode {
            TouchMode::DoubletapGesture => lock(&self.gestures).doubletap = value > 0,
            TouchMode::FodPressGesture => {
                let mut gestures = lock(&self.gestures);
                gestures.fod = true;
                gestures.aod = value > 0;
            }
            TouchMode::SingletapGesture => lock(&self.gestures).aod = value > 0,
            TouchMode::NonuiMode => {
                lock(&self.gestures).nonui_status = value;
                if self.flags.panel_off() {
                    self.apply_nonui_status(value);
                }
            }
            other => {
                return Err(TcmError::InvalidArgument(format!(
                    "touch mode {other:?} not supported"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn get_touch_mode(&self, mode: TouchMode) -> Result<i32> {
        let gestures = *lock(&self.gestures);
        match mode {
            TouchMode::DoubletapGesture => Ok(i32::from(gestures.doubletap)),
            TouchMode::SingletapGesture => Ok(i32::from(gestures.aod)),
            TouchMode::FodPressGesture => Ok(i32::from(gestures.fod)),
            TouchMode::NonuiMode => Ok(gestures.nonui_status),
            other => Err(TcmError::InvalidArgument(format!(
                "touch mode {other:?} not supported"
            ))),
        }
    }
}

impl TouchModeClient for TcmDevice {
    fn set_mode_value(&self, mode: TouchMode, value: i32) -> Result<()> {
        self.core().set_touch_mode(mode, value)
    }

    fn get_mode_value(&self, mode: TouchMode) -> Result<i32> {
        self.core().get_touch_mode(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::device::tests::{sim_device, sim_device_with};
    use crate::protocol::constants::*;
    use crate::protocol::FirmwareMode;
    use crate::registry::ModuleType;
    use crate::registry::tests::RecordingModule;
    use crate::transport::SimulatedController;
    use std::sync::{Arc, Mutex};

    fn count(sim: &SimulatedController, command: u8) -> usize {
        sim.commands().iter().filter(|&&c| c == command).count()
    }

    #[test]
    fn test_suspend_resume_without_gestures_sleeps() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        dev.register_module(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        dev.registry().flush();

        dev.early_suspend().unwrap();
        assert!(sim.is_sleeping());
        assert!(dev.is_sleeping());
        dev.suspend();
        assert!(dev.is_suspended());
        assert!(!dev.core().flags.do_polling());

        dev.resume().unwrap();
        assert!(!sim.is_sleeping());
        assert!(!dev.is_suspended());
        assert!(!dev.is_sleeping());
        assert!(dev.core().flags.do_polling());
        assert_eq!(count(&sim, CMD_REZERO), 1);

        let log = log.lock().unwrap();
        for entry in ["testing:early_suspend", "testing:suspend", "testing:resume"] {
            assert!(log.contains(&entry.to_string()), "missing {entry}");
        }
        drop(log);
        dev.remove();
    }

    #[test]
    fn test_gestures_keep_controller_awake() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();
        dev.set_mode_value(TouchMode::DoubletapGesture, 1).unwrap();

        dev.early_suspend().unwrap();
        dev.suspend();
        assert!(!sim.is_sleeping());
        assert!(dev.gestures().wakeup_enabled);
        // Still reading so gesture reports get through.
        assert!(dev.core().flags.do_polling());

        dev.resume().unwrap();
        assert_eq!(count(&sim, CMD_ENTER_DEEP_SLEEP), 0);
        dev.remove();
    }

    #[test]
    fn test_wakeup_gesture_disabled_by_config() {
        let mut config = DriverConfig::fast();
        config.wakeup_gesture = false;
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device_with(&sim, config);
        dev.probe().unwrap();
        dev.set_mode_value(TouchMode::DoubletapGesture, 1).unwrap();

        dev.early_suspend().unwrap();
        assert!(sim.is_sleeping());
        dev.suspend();
        dev.resume().unwrap();
        dev.remove();
    }

    #[test]
    fn test_fod_finger_skips_rezero() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();
        dev.set_mode_value(TouchMode::FodPressGesture, 1).unwrap();
        dev.set_fod_finger(true);

        dev.early_suspend().unwrap();
        dev.suspend();
        dev.resume().unwrap();
        assert_eq!(count(&sim, CMD_REZERO), 0);
        dev.remove();
    }

    #[test]
    fn test_resume_outside_firmware_resets() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();
        dev.early_suspend().unwrap();
        dev.suspend();

        dev.core()
            .update_identity(|identity| identity.id_info.mode = FirmwareMode::Bootloader);
        dev.resume().unwrap();
        assert!(sim.commands().contains(&CMD_RESET));
        assert_eq!(dev.mode(), FirmwareMode::Application);
        dev.remove();
    }

    #[test]
    fn test_early_suspend_outside_firmware_clears_suspending() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();
        dev.core()
            .update_identity(|identity| identity.id_info.mode = FirmwareMode::Bootloader);

        dev.early_suspend().unwrap();
        assert!(!dev.core().flags.in_suspending());
        assert!(!sim.is_sleeping());
        assert!(!dev.is_sleeping());
        dev.remove();
    }

    #[test]
    fn test_resume_sleep_exit_gives_up() {
        let mut config = DriverConfig::fast();
        config.response_timeout_ms = 20;
        config.resume_sleep_exit_retries = 2;
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device_with(&sim, config);
        dev.probe().unwrap();
        dev.early_suspend().unwrap();
        dev.suspend();

        sim.set_silent(true);
        assert!(matches!(dev.resume(), Err(TcmError::Timeout { .. })));
        assert_eq!(count(&sim, CMD_EXIT_DEEP_SLEEP), 3);
        assert!(!dev.is_suspended());
        sim.set_silent(false);
        dev.remove();
    }

    #[test]
    fn test_nonui_pocket_mode_sleeps_and_wakes() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();
        dev.set_mode_value(TouchMode::SingletapGesture, 1).unwrap();
        dev.early_suspend().unwrap();
        dev.suspend();
        assert!(!sim.is_sleeping());

        dev.set_mode_value(TouchMode::NonuiMode, 2).unwrap();
        assert!(sim.is_sleeping());
        assert!(dev.is_sleeping());
        assert!(!dev.core().flags.do_polling());

        dev.set_mode_value(TouchMode::NonuiMode, 0).unwrap();
        assert!(!sim.is_sleeping());
        assert!(!dev.is_sleeping());
        assert_eq!(
            sim.dynamic_config(DynamicConfigId::GESTURE_TYPE_ENABLE.value()),
            Some(GESTURE_SINGLE_TAP)
        );
        assert_eq!(dev.get_mode_value(TouchMode::NonuiMode).unwrap(), 0);

        dev.resume().unwrap();
        dev.remove();
    }

    #[test]
    fn test_nonui_ignored_with_panel_on() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);
        dev.probe().unwrap();

        dev.set_mode_value(TouchMode::NonuiMode, 2).unwrap();
        assert!(!sim.is_sleeping());
        assert_eq!(dev.gestures().nonui_status, 2);
        dev.remove();
    }

    #[test]
    fn test_touch_mode_values() {
        let sim = Arc::new(SimulatedController::new());
        let dev = sim_device(&sim);

        dev.set_mode_value(TouchMode::FodPressGesture, 0).unwrap();
        assert_eq!(dev.get_mode_value(TouchMode::FodPressGesture).unwrap(), 1);
        assert_eq!(dev.get_mode_value(TouchMode::SingletapGesture).unwrap(), 0);
        dev.set_mode_value(TouchMode::DoubletapGesture, 3).unwrap();
        assert_eq!(dev.get_mode_value(TouchMode::DoubletapGesture).unwrap(), 1);

        assert!(matches!(
            dev.set_mode_value(TouchMode::ReportRate, 240),
            Err(TcmError::InvalidArgument(_))
        ));
        assert!(dev.get_mode_value(TouchMode::FoldStatus).is_err());
    }
}
