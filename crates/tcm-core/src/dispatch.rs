//! Routing of inbound messages.
//!
//! Every read happens under the bus lock and the message is dispatched before
//! the lock is released, so a report view into the in buffer stays valid for
//! the duration of the callbacks and responses are never reordered with the
//! reports that follow them.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::device::{Core, HelperTask};
use crate::error::Result;
use crate::events::TcmEvent;
use crate::framer::{DispatchScope, Frame, ReadOutcome};
use crate::protocol::constants::*;
use crate::protocol::{FirmwareMode, StatusCode};

/// An unsolicited message, borrowed from the in buffer.
///
/// The payload is only valid inside the callback; copy it to keep it.
#[derive(Debug, Clone, Copy)]
pub struct Report<'a> {
    pub id: u8,
    pub payload: &'a [u8],
}

/// Consumer of touch frames, called directly from dispatch.
pub trait TouchReportHandler: Send + Sync {
    fn on_touch_report(&self, report: &Report<'_>);

    fn init(&self) {}

    /// Re-apply touch report configuration after a reset or host download.
    fn reinit(&self) {}

    fn early_suspend(&self) {}

    fn suspend(&self) {}

    fn resume(&self) {}
}

impl Core {
    /// Read one message and route it.
    ///
    /// A failed read resolves a pending command to Error so its submitter
    /// does not wait out the full timeout.
    #[instrument(level = "trace", skip_all)]
    pub(crate) fn read_and_dispatch(&self) -> Result<ReadOutcome> {
        let _scope = DispatchScope::enter();
        let mut session = self.transport.lock();

        let outcome = match self.framer.read_message(&mut session) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(error = %e, "Failed to read message");
                self.engine.fail_pending();
                return Err(e);
            }
        };

        if let ReadOutcome::Message(frame) = outcome {
            let data = session.in_buf().data();
            let payload = &data[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + frame.length];
            self.dispatch_message(frame, payload);
        }
        Ok(outcome)
    }

    fn dispatch_message(&self, frame: Frame, payload: &[u8]) {
        let code = frame.code;

        if code.value() == REPORT_IDENTIFY && !self.dispatch_identify(payload) {
            return;
        }

        if code.is_report() {
            self.dispatch_report(code.value(), payload);
        } else {
            self.dispatch_response(code, payload);
        }
    }

    /// Returns false when the identify report must not reach the modules.
    fn dispatch_identify(&self, payload: &[u8]) -> bool {
        let info = match self.identity().id_info.overlay(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Failed to decode identify report");
                return true;
            }
        };
        let mode = info.mode;
        let max_write = info.max_write_size;

        self.adopt_identify(info);
        self.transport
            .set_wr_chunk_size(self.negotiated_wr_chunk(max_write));

        if let Some(command) = self.engine.pending_command() {
            if MODE_TRANSITION_COMMANDS.contains(&command) {
                debug!(command = %format!("0x{:02X}", command), mode = %mode, "Mode transition completed");
                self.engine.complete_mode_transition();
            } else {
                warn!(command = %format!("0x{:02X}", command), "Device has been reset");
                self.engine.fail_device_reset();
            }
        } else {
            if mode == FirmwareMode::RomBootloader && self.flags.in_hdl_mode() {
                self.schedule_helper(HelperTask::SendRombootHdl);
                return false;
            }

            if self.config.force_run_application_firmware
                && !mode.is_firmware()
                && self.reset_lock.try_lock().is_ok()
            {
                self.schedule_helper(HelperTask::RunApplicationFirmware);
                return false;
            }
        }

        !self.is_host_downloading()
    }

    fn dispatch_report(&self, id: u8, payload: &[u8]) {
        let report = Report { id, payload };
        self.observer.on_event(&TcmEvent::Report {
            id,
            length: payload.len(),
        });

        if id == REPORT_TOUCH {
            match self.touch_handler() {
                Some(handler) => handler.on_touch_report(&report),
                None => debug!("Touch report with no handler"),
            }
            return;
        }

        if id == REPORT_IDENTIFY && self.identity().mode().is_firmware() {
            self.schedule_helper(HelperTask::TouchReinit);
        }

        self.registry.dispatch_report(&report);

        if self.config.report_notifier {
            self.async_report_id.store(id, std::sync::atomic::Ordering::SeqCst);
            self.notifier.schedule(Duration::ZERO);
        }
    }

    fn dispatch_response(&self, code: StatusCode, payload: &[u8]) {
        self.engine.complete_response(code, payload.len(), payload);
    }

    /// Hand modules a synthetic, payloadless report that starts a host download.
    pub(crate) fn check_host_download(&self, id: u8) {
        info!(id = %format!("0x{:02X}", id), "Triggering host download");
        self.registry.dispatch_report(&Report { id, payload: &[] });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandState;
    use crate::protocol::IdentifyInfo;
    use crate::config::DriverConfig;
    use crate::device::TcmDevice;
    use crate::registry::ModuleType;
    use crate::registry::tests::RecordingModule;
    use crate::transport::{MockBus, TcmBus};
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn device(mock: &Arc<MockBus>) -> TcmDevice {
        let bus: Arc<dyn TcmBus> = mock.clone();
        TcmDevice::new(bus, DriverConfig::fast())
    }

    struct CountingTouch(Mutex<Vec<usize>>);

    impl TouchReportHandler for CountingTouch {
        fn on_touch_report(&self, report: &Report<'_>) {
            self.0.lock().unwrap().push(report.payload.len());
        }
    }

    #[test]
    fn test_empty_report_dispatches_to_modules() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let log = Arc::new(Mutex::new(Vec::new()));
        dev.registry().mark_initialized();
        dev.register_module(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        dev.registry().flush();

        mock.queue_message(REPORT_DELTA, &[]);
        let outcome = dev.core().read_and_dispatch().unwrap();
        assert!(matches!(outcome, ReadOutcome::Message(frame) if frame.length == 0));
        assert!(log.lock().unwrap().contains(&"testing:report12/0".to_string()));
        assert_eq!(dev.core().engine.state(), CommandState::Idle);
    }

    #[test]
    fn test_touch_report_bypasses_modules() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let log = Arc::new(Mutex::new(Vec::new()));
        dev.registry().mark_initialized();
        dev.register_module(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        dev.registry().flush();
        let touch = Arc::new(CountingTouch(Mutex::new(Vec::new())));
        dev.set_touch_handler(touch.clone());

        mock.queue_message(REPORT_TOUCH, &[1, 2, 3]);
        dev.core().read_and_dispatch().unwrap();

        assert_eq!(*touch.0.lock().unwrap(), vec![3]);
        assert!(
            !log.lock()
                .unwrap()
                .iter()
                .any(|entry| entry.contains("report11"))
        );
    }

    #[test]
    fn test_identify_completes_pending_reset() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let core = dev.core().clone();

        let waiter = thread::spawn(move || core.engine.send(CMD_RESET, &[]));
        while dev.core().engine.pending_command().is_none() {
            thread::sleep(Duration::from_millis(1));
        }

        let info = IdentifyInfo {
            mode: FirmwareMode::Application,
            max_write_size: 64,
            ..Default::default()
        };
        mock.queue_continued_message(REPORT_IDENTIFY, &info.to_bytes(), MIN_READ_LENGTH);
        dev.core().read_and_dispatch().unwrap();

        let response = waiter.join().unwrap().unwrap();
        assert!(response.status.is_ok());
        assert_eq!(dev.identity().mode(), FirmwareMode::Application);
        assert_eq!(dev.core().transport.wr_chunk_size(), 64);
    }

    #[test]
    fn test_identify_during_other_command_is_device_reset() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let core = dev.core().clone();

        let waiter = thread::spawn(move || core.engine.send(CMD_GET_DYNAMIC_CONFIG, &[1]));
        while dev.core().engine.pending_command().is_none() {
            thread::sleep(Duration::from_millis(1));
        }

        let info = IdentifyInfo {
            mode: FirmwareMode::Bootloader,
            build_id: 77,
            ..Default::default()
        };
        mock.queue_continued_message(REPORT_IDENTIFY, &info.to_bytes(), MIN_READ_LENGTH);
        dev.core().read_and_dispatch().unwrap();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            crate::error::TcmError::DeviceReset {
                command: CMD_GET_DYNAMIC_CONFIG
            }
        ));
        // Identity is still refreshed.
        assert_eq!(dev.identity().packrat_number, 77);
    }

    #[test]
    fn test_romboot_identify_in_hdl_mode_schedules_helper() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let log = Arc::new(Mutex::new(Vec::new()));
        dev.registry().mark_initialized();
        dev.register_module(RecordingModule::new(ModuleType::ZeroFlash, &log))
            .unwrap();
        dev.registry().flush();
        dev.core().flags.set_in_hdl_mode(true);

        let info = IdentifyInfo {
            mode: FirmwareMode::RomBootloader,
            ..Default::default()
        };
        mock.queue_continued_message(REPORT_IDENTIFY, &info.to_bytes(), MIN_READ_LENGTH);
        dev.core().read_and_dispatch().unwrap();
        dev.core().helper.flush();

        let log = log.lock().unwrap();
        // The identify itself is withheld; the helper delivers the trigger.
        assert!(!log.iter().any(|entry| entry.contains("report10")));
        assert!(log.contains(&"zeroflash:reportFD/0".to_string()));
    }

    #[test]
    fn test_empty_identify_keeps_identity() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);

        let info = IdentifyInfo {
            mode: FirmwareMode::Application,
            build_id: 4242,
            max_write_size: 64,
            ..Default::default()
        };
        mock.queue_continued_message(REPORT_IDENTIFY, &info.to_bytes(), MIN_READ_LENGTH);
        dev.core().read_and_dispatch().unwrap();
        assert_eq!(dev.identity().id_info, info);

        mock.queue_message(REPORT_IDENTIFY, &[]);
        dev.core().read_and_dispatch().unwrap();
        let identity = dev.identity();
        assert_eq!(identity.id_info, info);
        assert_eq!(identity.packrat_number, 4242);
        assert_eq!(dev.core().transport.wr_chunk_size(), 64);
    }

    #[test]
    fn test_persistent_invalid_status_completes_command() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let core = dev.core().clone();

        let waiter = thread::spawn(move || core.engine.send(CMD_REZERO, &[]));
        while dev.core().engine.pending_command().is_none() {
            thread::sleep(Duration::from_millis(1));
        }

        mock.queue_read(&[MESSAGE_MARKER, STATUS_INVALID, 0, 0]);
        mock.queue_read(&[MESSAGE_MARKER, STATUS_INVALID, 0, 0]);
        dev.core().read_and_dispatch().unwrap();

        let response = waiter.join().unwrap().unwrap();
        assert_eq!(response.status, StatusCode(STATUS_INVALID));
        assert!(response.payload.is_empty());
    }

    #[test]
    fn test_read_error_fails_pending_command() {
        let mock = Arc::new(MockBus::new());
        let dev = device(&mock);
        let core = dev.core().clone();

        let waiter = thread::spawn(move || core.engine.send(CMD_REZERO, &[]));
        while dev.core().engine.pending_command().is_none() {
            thread::sleep(Duration::from_millis(1));
        }

        mock.queue_read(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        mock.queue_read(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(dev.core().read_and_dispatch().is_err());

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, crate::error::TcmError::Io { command: CMD_REZERO }));
    }
}
