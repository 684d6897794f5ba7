//! Command submission and response correlation.
//!
//! One transactional command may be outstanding per device. The submitter
//! writes the command under the bus lock, then waits on a condition variable
//! until the dispatcher resolves the slot to Idle (response copied) or Error.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::error::{Result, TcmError};
use crate::events::{TcmEvent, TcmObserver};
use crate::framer;
use crate::protocol::constants::*;
use crate::protocol::StatusCode;
use crate::transport::{ChunkedTransport, TransportBuffer};
use crate::worker::DelayedWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    #[default]
    Idle,
    Busy,
    Error,
}

/// Why a Busy command was resolved to Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Io,
    DeviceReset,
    CopyFault { needed: usize, available: usize },
}

#[derive(Debug, Default)]
struct CommandSlot {
    state: CommandState,
    command: u8,
    response_code: u8,
    failure: Option<Failure>,
}

/// A completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub command: u8,
    pub status: StatusCode,
    pub payload: Vec<u8>,
}

pub struct CommandEngine {
    transport: Arc<ChunkedTransport>,
    observer: Arc<dyn TcmObserver>,
    command_lock: Mutex<()>,
    slot: Mutex<CommandSlot>,
    done: Condvar,
    resp: Mutex<TransportBuffer>,
    timeout: Duration,
    polling_delay: Duration,
    poller: RwLock<Option<Arc<DelayedWork>>>,
    host_download_mode: AtomicBool,
}

impl CommandEngine {
    pub fn new(
        transport: Arc<ChunkedTransport>,
        observer: Arc<dyn TcmObserver>,
        timeout: Duration,
        polling_delay: Duration,
    ) -> Self {
        Self {
            transport,
            observer,
            command_lock: Mutex::new(()),
            slot: Mutex::new(CommandSlot::default()),
            done: Condvar::new(),
            resp: Mutex::new(TransportBuffer::new()),
            timeout,
            polling_delay,
            poller: RwLock::new(None),
            host_download_mode: AtomicBool::new(false),
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, CommandSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_resp(&self) -> MutexGuard<'_, TransportBuffer> {
        self.resp.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Poll timer to pause around each bus write, if polling replaces the interrupt.
    pub fn set_poller(&self, poller: Option<Arc<DelayedWork>>) {
        *self.poller.write().unwrap_or_else(|e| e.into_inner()) = poller;
    }

    fn poller(&self) -> Option<Arc<DelayedWork>> {
        self.poller
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// In host download mode a reset is answered by the ROM bootloader, not
    /// by a response, so the submitter does not wait for it.
    pub fn set_host_download_mode(&self, enabled: bool) {
        self.host_download_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn state(&self) -> CommandState {
        self.lock_slot().state
    }

    /// Command currently waiting for its response.
    pub fn pending_command(&self) -> Option<u8> {
        let slot = self.lock_slot();
        (slot.state == CommandState::Busy).then_some(slot.command)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit a command and wait for its response, polling at the default delay.
    pub fn send(&self, command: u8, payload: &[u8]) -> Result<Response> {
        self.send_with_delay(command, payload, self.polling_delay)
    }

    /// Submit a command and require `STATUS_OK`.
    pub fn request(&self, command: u8, payload: &[u8]) -> Result<Response> {
        self.request_with_delay(command, payload, self.polling_delay)
    }

    /// `request` with an explicit first poll delay, for commands the
    /// controller takes a while to act on.
    pub fn request_with_delay(
        &self,
        command: u8,
        payload: &[u8],
        polling_delay: Duration,
    ) -> Result<Response> {
        let response = self.send_with_delay(command, payload, polling_delay)?;
        if !response.status.is_ok() {
            return Err(TcmError::CommandRejected {
                command,
                status: response.status.value(),
            });
        }
        Ok(response)
    }

    #[instrument(level = "debug", skip_all, fields(command = %format!("0x{:02X}", command), len = payload.len()))]
    pub fn send_with_delay(
        &self,
        command: u8,
        payload: &[u8],
        polling_delay: Duration,
    ) -> Result<Response> {
        if framer::in_dispatch() {
            warn!("Command submitted from dispatch context");
            return Err(TcmError::InvalidContext);
        }

        let _command_guard = self.command_lock.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut slot = self.lock_slot();
            if slot.state == CommandState::Error {
                debug!(previous = %format!("0x{:02X}", slot.command), "Clearing error state");
            }
            *slot = CommandSlot {
                state: CommandState::Busy,
                command,
                response_code: STATUS_IDLE,
                failure: None,
            };
        }

        let poller = self.poller().filter(|_| !polling_delay.is_zero());
        if let Some(poller) = &poller {
            poller.cancel_sync();
        }

        let written = self.transport.lock().write_command(command, payload);

        if let Some(poller) = &poller {
            poller.schedule(polling_delay);
        }

        if let Err(e) = written {
            self.lock_slot().state = CommandState::Idle;
            self.observer.on_event(&TcmEvent::CommandFailed {
                command,
                message: e.to_string(),
            });
            return Err(e);
        }

        if command == CMD_RESET && self.host_download_mode.load(Ordering::SeqCst) {
            self.lock_slot().state = CommandState::Idle;
            debug!("Reset in host download mode, not waiting");
            return Ok(Response {
                command,
                status: StatusCode(STATUS_OK),
                payload: Vec::new(),
            });
        }

        let result = self.wait(command);
        match &result {
            Ok(response) => self.observer.on_event(&TcmEvent::CommandCompleted {
                command,
                status: response.status.value(),
                length: response.payload.len(),
            }),
            Err(e) => self.observer.on_event(&TcmEvent::CommandFailed {
                command,
                message: e.to_string(),
            }),
        }
        result
    }

    fn wait(&self, command: u8) -> Result<Response> {
        let deadline = Instant::now() + self.timeout;
        let mut slot = self.lock_slot();

        while slot.state == CommandState::Busy {
            let now = Instant::now();
            if now >= deadline {
                // Left in Error so a late response is not copied for nobody.
                slot.state = CommandState::Error;
                warn!(
                    command = %format!("0x{:02X}", command),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for response"
                );
                return Err(TcmError::Timeout { command });
            }
            slot = self
                .done
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        let failure = slot.failure.take();
        let status = StatusCode(slot.response_code);
        slot.state = CommandState::Idle;

        match failure {
            None => {
                let payload = self.lock_resp().data().to_vec();
                Ok(Response {
                    command,
                    status,
                    payload,
                })
            }
            Some(Failure::DeviceReset) => Err(TcmError::DeviceReset { command }),
            Some(Failure::CopyFault { needed, available }) => {
                Err(TcmError::CopyFault { needed, available })
            }
            Some(Failure::Io) => Err(TcmError::Io { command }),
        }
    }

    /// Write `command ++ data` without a length prefix and without waiting.
    pub fn send_raw(&self, command: u8, data: &[u8]) -> Result<()> {
        let _command_guard = self.command_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.transport.lock().raw_write(command, data)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatcher side. Called with the bus lock held.
    // ------------------------------------------------------------------

    /// Resolve the pending command with `length` payload bytes taken from `source`.
    pub fn complete_response(&self, code: StatusCode, length: usize, source: &[u8]) {
        let mut slot = self.lock_slot();
        if slot.state != CommandState::Busy {
            debug!(code = %code, "Response with no command pending");
            return;
        }
        slot.response_code = code.value();

        let mut resp = self.lock_resp();
        resp.alloc(length);
        match resp.copy_in(0, source, length) {
            Ok(()) => {
                resp.set_data_length(length);
                slot.state = CommandState::Idle;
            }
            Err(TcmError::CopyFault { needed, available }) => {
                warn!(needed, available, "Failed to copy response payload");
                slot.failure = Some(Failure::CopyFault { needed, available });
                slot.state = CommandState::Error;
            }
            Err(_) => {
                slot.failure = Some(Failure::Io);
                slot.state = CommandState::Error;
            }
        }
        drop(resp);
        self.done.notify_all();
    }

    /// An identify report completed a reset or mode-switch command.
    pub fn complete_mode_transition(&self) {
        let mut slot = self.lock_slot();
        if slot.state != CommandState::Busy {
            return;
        }
        slot.response_code = STATUS_OK;
        self.lock_resp().set_data_length(0);
        slot.state = CommandState::Idle;
        self.done.notify_all();
    }

    /// The controller reset itself while a command was pending.
    pub fn fail_device_reset(&self) {
        self.fail(Failure::DeviceReset);
    }

    /// A read failed; the pending command cannot complete.
    pub fn fail_pending(&self) {
        self.fail(Failure::Io);
    }

    fn fail(&self, failure: Failure) {
        let mut slot = self.lock_slot();
        if slot.state != CommandState::Busy {
            return;
        }
        slot.failure = Some(failure);
        slot.state = CommandState::Error;
        self.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::framer::DispatchScope;
    use crate::transport::MockBus;
    use std::thread;

    fn engine(mock: &Arc<MockBus>, wr_chunk: usize, timeout_ms: u64) -> Arc<CommandEngine> {
        let transport = Arc::new(ChunkedTransport::new(mock.clone(), 0, wr_chunk));
        Arc::new(CommandEngine::new(
            transport,
            Arc::new(NullObserver),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(5),
        ))
    }

    /// Answer each pending command with `reply(command)`.
    fn responder(
        engine: &Arc<CommandEngine>,
        count: usize,
        reply: fn(u8) -> Vec<u8>,
    ) -> thread::JoinHandle<()> {
        let engine = engine.clone();
        thread::spawn(move || {
            let mut answered = 0;
            while answered < count {
                if let Some(command) = engine.pending_command() {
                    let payload = reply(command);
                    engine.complete_response(StatusCode(STATUS_OK), payload.len(), &payload);
                    answered += 1;
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    }

    #[test]
    fn test_send_returns_response_payload() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 1000);
        let handle = responder(&engine, 1, |_| vec![0xAA, 0xBB]);

        let response = engine.send(CMD_GET_DYNAMIC_CONFIG, &[7]).unwrap();
        handle.join().unwrap();

        assert_eq!(response.status, StatusCode(STATUS_OK));
        assert_eq!(response.payload, vec![0xAA, 0xBB]);
        assert_eq!(engine.state(), CommandState::Idle);
        assert_eq!(mock.get_writes(), vec![vec![CMD_GET_DYNAMIC_CONFIG, 1, 0, 7]]);
    }

    #[test]
    fn test_timeout_leaves_error_state() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 30);

        let err = engine.send(CMD_IDENTIFY, &[]).unwrap_err();
        assert!(matches!(err, TcmError::Timeout { command: CMD_IDENTIFY }));
        assert_eq!(engine.state(), CommandState::Error);

        // A late response is discarded.
        engine.complete_response(StatusCode(STATUS_OK), 3, &[1, 2, 3]);
        assert_eq!(engine.state(), CommandState::Error);

        // The next submission is accepted.
        let handle = responder(&engine, 1, |_| Vec::new());
        assert!(engine.send(CMD_IDENTIFY, &[]).is_ok());
        handle.join().unwrap();
        assert_eq!(engine.state(), CommandState::Idle);
    }

    #[test]
    fn test_device_reset_fails_pending() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 1000);
        let e = engine.clone();
        let handle = thread::spawn(move || {
            while e.pending_command().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            e.fail_device_reset();
        });

        let err = engine.send(CMD_GET_FEATURES, &[]).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, TcmError::DeviceReset { command: CMD_GET_FEATURES }));
        assert_eq!(engine.state(), CommandState::Idle);
    }

    #[test]
    fn test_mode_transition_completion() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 1000);
        let e = engine.clone();
        let handle = thread::spawn(move || {
            while e.pending_command() != Some(CMD_RESET) {
                thread::sleep(Duration::from_millis(1));
            }
            e.complete_mode_transition();
        });

        let response = engine.send(CMD_RESET, &[]).unwrap();
        handle.join().unwrap();
        assert!(response.status.is_ok());
        assert!(response.payload.is_empty());
    }

    #[test]
    fn test_request_rejects_error_status() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 1000);
        let e = engine.clone();
        let handle = thread::spawn(move || {
            while e.pending_command().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            e.complete_response(StatusCode(STATUS_ERROR), 0, &[]);
        });

        let err = engine.request(CMD_SET_DYNAMIC_CONFIG, &[1]).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(
            err,
            TcmError::CommandRejected {
                command: CMD_SET_DYNAMIC_CONFIG,
                status: STATUS_ERROR
            }
        ));
    }

    #[test]
    fn test_copy_fault_surfaces() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 1000);
        let e = engine.clone();
        let handle = thread::spawn(move || {
            while e.pending_command().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            // Announced 8 bytes, only 3 available.
            e.complete_response(StatusCode(STATUS_OK), 8, &[1, 2, 3]);
        });

        let err = engine.send(CMD_GET_STATIC_CONFIG, &[]).unwrap_err();
        handle.join().unwrap();
        assert!(matches!(err, TcmError::CopyFault { needed: 8, .. }));
        assert_eq!(engine.state(), CommandState::Idle);
    }

    #[test]
    fn test_rejected_inside_dispatch() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 1000);
        let _scope = DispatchScope::enter();
        assert!(matches!(
            engine.send(CMD_IDENTIFY, &[]),
            Err(TcmError::InvalidContext)
        ));
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_concurrent_commands_serialize() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 3, 2000);
        let handle = responder(&engine, 8, |command| vec![command]);

        let workers: Vec<_> = (0..8u8)
            .map(|i| {
                let engine = engine.clone();
                thread::spawn(move || {
                    let payload = vec![i; 5];
                    let response = engine.send(0x50 + i, &payload).unwrap();
                    assert_eq!(response.payload, vec![0x50 + i]);
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        handle.join().unwrap();

        // Each command's chunks are contiguous on the wire.
        let writes = mock.get_writes();
        assert_eq!(writes.len(), 8 * 4);
        for command in writes.chunks(4) {
            let head = command[0][0];
            assert!((0x50..0x58).contains(&head));
            assert!(command[1..].iter().all(|c| c[0] == CMD_CONTINUE_WRITE));
            let stream: Vec<u8> = command.iter().flat_map(|c| c[1..].to_vec()).collect();
            assert_eq!(stream, [&[5u8, 0][..], &[head - 0x50; 5][..]].concat());
        }
    }

    #[test]
    fn test_reset_in_host_download_mode_does_not_wait() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 5000);
        engine.set_host_download_mode(true);
        let started = Instant::now();
        assert!(engine.send(CMD_RESET, &[]).is_ok());
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_raw_send_does_not_wait() {
        let mock = Arc::new(MockBus::new());
        let engine = engine(&mock, 0, 5000);
        engine.send_raw(CMD_WRITE_PROGRAM_RAM, &[1, 2]).unwrap();
        assert_eq!(mock.get_writes(), vec![vec![CMD_WRITE_PROGRAM_RAM, 1, 2]]);
        assert_eq!(engine.state(), CommandState::Idle);
    }
}
