//! Background work: interrupt and polling pumps, watchdog, helper slot,
//! host download handshake and ESD recovery.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::device::{Core, HelperTask, lock, ms, try_lock};
use crate::error::{Result, TcmError};
use crate::events::TcmEvent;
use crate::protocol::constants::*;
use crate::state::SensorType;
use crate::transport::BusType;

impl Core {
    /// Enable the attention interrupt, or poll when none can be installed.
    pub(crate) fn enable_irq(&self, enable: bool) {
        let _irq = lock(&self.irq_lock);

        if enable {
            if self.flags.irq_enabled() || self.flags.do_polling() {
                debug!("Interrupt already enabled");
                return;
            }

            if self.hw.as_ref().is_some_and(|hw| hw.irq_available()) {
                self.flags.set_irq_enabled(true);
                debug!("Interrupt enabled");
            } else {
                self.engine.set_poller(Some(self.polling.clone()));
                self.flags.set_do_polling(true);
                self.polling.schedule(ms(self.config.polling_delay_ms));
                debug!(delay_ms = self.config.polling_delay_ms, "Polling enabled");
            }
            thread::sleep(ms(self.config.enable_irq_delay_ms));
            return;
        }

        self.flags.set_irq_enabled(false);
        if self.flags.do_polling() {
            self.flags.set_do_polling(false);
            self.polling.cancel_sync();
            self.engine.set_poller(None);
            debug!("Polling disabled");
        }
    }

    pub(crate) fn handle_interrupt(&self) {
        if !self.flags.irq_enabled() {
            return;
        }
        if let Some(hw) = &self.hw
            && !hw.attention_asserted()
        {
            return;
        }

        if let Err(e) = self.read_and_dispatch() {
            if self.identity().sensor_type == SensorType::F35 {
                self.check_host_download(REPORT_HDL_F35);
            } else {
                debug!(error = %e, "Failed to read message");
            }
        }
    }

    pub(crate) fn polling_work(&self) {
        if !self.flags.do_polling() {
            return;
        }

        let result = self.read_and_dispatch();
        if let Err(e) = &result
            && matches!(e, TcmError::Framing { .. })
            && self.transport.bus_type() == BusType::Spi
        {
            self.check_host_download(REPORT_HDL_F35);
        }

        if self.flags.do_polling() && !(self.flags.in_suspend() && result.is_err()) {
            self.polling.schedule(ms(self.config.polling_delay_ms));
        }
    }

    /// Start or stop the periodic liveness probe.
    pub(crate) fn update_watchdog(&self, enable: bool) {
        self.watchdog.cancel_sync();

        if enable && self.config.watchdog_enabled {
            if !self.flags.watchdog_running() {
                self.watchdog_count.store(0, Ordering::SeqCst);
            }
            self.flags.set_watchdog_running(true);
            self.watchdog.schedule(ms(self.config.watchdog_delay_ms));
        } else {
            self.flags.set_watchdog_running(false);
            self.watchdog_count.store(0, Ordering::SeqCst);
        }
    }

    /// One watchdog round. A busy bus counts as alive.
    pub(crate) fn watchdog_work(&self) {
        let alive = self
            .transport
            .try_lock()
            .map(|mut session| matches!(session.read_marker(), Ok(MESSAGE_MARKER)));

        match alive {
            Some(true) => self.watchdog_count.store(0, Ordering::SeqCst),
            Some(false) => {
                let count = self.watchdog_count.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(count, "Incorrect marker from watchdog probe");

                if count >= self.config.watchdog_trigger_count {
                    // Whoever holds the reset lock may be waiting for this
                    // work to finish; skip the round instead of blocking.
                    match try_lock(&self.reset_lock) {
                        Some(guard) => {
                            if let Err(e) = self.reset_and_reinit_locked(guard, true, false) {
                                error!(error = %e, "Watchdog failed to reset the controller");
                            }
                        }
                        None => debug!("Reset in progress, skipping watchdog reset"),
                    }
                    self.watchdog_count.store(0, Ordering::SeqCst);
                }
            }
            None => {}
        }

        if self.flags.watchdog_running() {
            self.watchdog.schedule(ms(self.config.watchdog_delay_ms));
        }
    }

    /// Occupy the helper slot with `task`. Dropped if the slot is taken.
    pub(crate) fn schedule_helper(&self, task: HelperTask) {
        let mut slot = lock(&self.helper_task);
        if let Some(busy) = *slot {
            warn!(?busy, ?task, "Helper thread is busy");
            return;
        }
        *slot = Some(task);
        drop(slot);
        self.helper.schedule(Duration::ZERO);
    }

    pub(crate) fn run_helper(&self) {
        let Some(task) = *lock(&self.helper_task) else {
            return;
        };
        debug!(?task, "Helper task");

        match task {
            HelperTask::RunApplicationFirmware => {
                let _reset = lock(&self.reset_lock);
                self.update_watchdog(false);
                if let Err(e) = self.run_application_firmware() {
                    error!(error = %e, "Failed to switch to application mode");
                }
                self.update_watchdog(true);
            }
            HelperTask::SendReinitNotification => {
                {
                    let _reset = lock(&self.reset_lock);
                    match self.identify(true) {
                        Ok(()) => {
                            if let Some(touch) = self.touch_handler() {
                                touch.reinit();
                            }
                            self.registry.reinit_all();
                        }
                        Err(e) => error!(error = %e, "Failed to identify after host download"),
                    }
                }
                self.set_host_downloading(false);
            }
            HelperTask::TouchReinit => {
                if let Some(touch) = self.touch_handler() {
                    touch.reinit();
                }
                self.resend_charger_state();
            }
            HelperTask::SendRombootHdl => self.check_host_download(REPORT_HDL_ROMBOOT),
        }

        *lock(&self.helper_task) = None;
    }

    pub(crate) fn notify_async_report(&self) {
        let id = self.async_report_id.load(Ordering::SeqCst);
        self.registry.dispatch_async_report(id);
    }

    pub(crate) fn is_host_downloading(&self) -> bool {
        *lock(&self.host_download)
    }

    pub(crate) fn set_host_downloading(&self, active: bool) {
        let mut downloading = lock(&self.host_download);
        if *downloading == active {
            return;
        }
        *downloading = active;
        drop(downloading);

        if !active {
            self.host_download_done.notify_all();
        }
        self.observer.on_event(&TcmEvent::HostDownload { active });
    }

    /// Wait for a running host download to finish.
    ///
    /// On timeout the downloading flag is forced off so nothing else waits
    /// on it.
    #[instrument(level = "debug", skip(self))]
    pub(crate) fn wait_host_download(&self) -> Result<()> {
        thread::sleep(ms(self.config.host_download_wait_ms));

        let downloading = lock(&self.host_download);
        if !*downloading {
            return Ok(());
        }

        let (mut downloading, _) = self
            .host_download_done
            .wait_timeout_while(
                downloading,
                ms(self.config.host_download_timeout_ms),
                |active| *active,
            )
            .unwrap_or_else(|e| e.into_inner());
        if *downloading {
            *downloading = false;
            drop(downloading);
            error!(timeout_ms = self.config.host_download_timeout_ms, "Timed out waiting for host download");
            self.observer
                .on_event(&TcmEvent::HostDownload { active: false });
            return Err(TcmError::HostDownloadTimeout);
        }
        Ok(())
    }

    /// Power cycle, then hardware reset and reinitialize.
    #[instrument(level = "info", skip(self))]
    pub(crate) fn esd_recovery(&self) -> Result<()> {
        let _esd = lock(&self.esd_lock);
        let hw = self.hw.clone().ok_or(TcmError::HardwareResetUnavailable)?;

        warn!("Recovering from ESD");
        hw.set_power(false)?;
        thread::sleep(ms(self.config.reset_active_ms));
        if let Err(e) = hw.set_power(true) {
            error!(error = %e, "Failed to power the controller back on");
        }

        self.reset_and_reinit(true, true)?;
        info!("ESD recovery complete");
        Ok(())
    }
}
