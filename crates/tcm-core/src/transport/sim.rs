//! Behavioural model of a TCM touch controller.
//!
//! Speaks the wire protocol on the device side: reassembles chunked
//! commands, answers them with framed responses, serves messages across
//! continued reads and emits identify reports on power-up, reset and mode
//! switches. Faults can be injected to exercise recovery paths.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::traits::{BusType, HardwareControl, TcmBus, TransportError};
use crate::protocol::constants::*;
use crate::protocol::{AppInfo, FirmwareMode, IdentifyInfo};

/// Command bytes collected across write chunks.
#[derive(Debug)]
struct PendingCommand {
    command: u8,
    /// `[len_lo][len_hi][payload...]`
    stream: Vec<u8>,
}

impl PendingCommand {
    fn payload(&self) -> Option<&[u8]> {
        if self.stream.len() < 2 {
            return None;
        }
        let expected = u16::from_le_bytes([self.stream[0], self.stream[1]]) as usize;
        self.stream.get(2..2 + expected)
    }
}

#[derive(Debug)]
struct SimState {
    powered: bool,
    in_reset: bool,
    mode: u8,
    boot_mode: u8,
    identify: IdentifyInfo,
    app_info: AppInfo,
    boot_info: Vec<u8>,
    romboot_info: Vec<u8>,
    features: Vec<u8>,
    static_config: Vec<u8>,
    dynamic_config: HashMap<u8, u16>,
    data_locations: HashMap<u8, (u16, u16)>,
    sleeping: bool,

    outbox: VecDeque<Vec<u8>>,
    /// Message being served across continued reads, and bytes delivered.
    current: Option<(Vec<u8>, usize)>,
    pending: Option<PendingCommand>,

    silent: bool,
    bad_markers: u32,
    read_errors: u32,
    stuck_mode: bool,
    booting_polls: u32,
    irq_available: bool,

    commands: Vec<u8>,
    write_chunks: Vec<Vec<u8>>,
    hardware_resets: u32,
}

fn frame(code: u8, payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u16).to_le_bytes();
    let mut msg = Vec::with_capacity(payload.len() + MESSAGE_HEADER_SIZE + 1);
    msg.extend_from_slice(&[MESSAGE_MARKER, code, len[0], len[1]]);
    msg.extend_from_slice(payload);
    msg.push(MESSAGE_PADDING);
    msg
}

impl SimState {
    fn identify_payload(&self) -> Vec<u8> {
        let mut info = self.identify.clone();
        info.mode = FirmwareMode::from_code(self.mode);
        info.to_bytes()
    }

    fn respond(&mut self, status: u8, payload: &[u8]) {
        self.outbox.push_back(frame(status, payload));
    }

    fn report_identify(&mut self) {
        let payload = self.identify_payload();
        self.outbox.push_back(frame(REPORT_IDENTIFY, &payload));
    }

    /// Replace the pending power-on identify report after a builder change.
    fn requeue_power_on_report(&mut self) {
        self.outbox.clear();
        self.current = None;
        self.report_identify();
    }

    fn reboot(&mut self) {
        self.outbox.clear();
        self.current = None;
        self.pending = None;
        self.sleeping = false;
        self.mode = self.boot_mode;
        self.report_identify();
    }

    fn execute(&mut self, command: u8, payload: &[u8]) {
        self.commands.push(command);
        debug!(command = %format!("0x{:02X}", command), len = payload.len(), "Simulator command");
        if self.silent {
            return;
        }

        if self.sleeping
            && !matches!(command, CMD_EXIT_DEEP_SLEEP | CMD_RESET | CMD_IDENTIFY)
        {
            self.respond(STATUS_NOT_EXECUTED_IN_DEEP_SLEEP, &[]);
            return;
        }

        match command {
            CMD_IDENTIFY => {
                let info = self.identify_payload();
                self.respond(STATUS_OK, &info);
            }
            CMD_RESET => self.reboot(),
            CMD_RUN_APPLICATION_FIRMWARE => self.switch_mode(MODE_APPLICATION_FIRMWARE),
            CMD_RUN_BOOTLOADER_FIRMWARE | CMD_ROMBOOT_RUN_BOOTLOADER_FIRMWARE => {
                self.switch_mode(MODE_BOOTLOADER)
            }
            CMD_ENTER_PRODUCTION_TEST_MODE => self.switch_mode(MODE_PRODUCTIONTEST_FIRMWARE),
            CMD_GET_APPLICATION_INFO => {
                let mut info = self.app_info.clone();
                if self.booting_polls > 0 {
                    self.booting_polls -= 1;
                    info.status = APP_STATUS_BOOTING;
                }
                self.respond(STATUS_OK, &info.to_bytes());
            }
            CMD_GET_BOOT_INFO => {
                let info = self.boot_info.clone();
                self.respond(STATUS_OK, &info);
            }
            CMD_GET_ROMBOOT_INFO => {
                let info = self.romboot_info.clone();
                self.respond(STATUS_OK, &info);
            }
            CMD_GET_DYNAMIC_CONFIG => match payload.first() {
                Some(id) => {
                    let value = self.dynamic_config.get(id).copied().unwrap_or(0);
                    self.respond(STATUS_OK, &value.to_le_bytes());
                }
                None => self.respond(STATUS_ERROR, &[]),
            },
            CMD_SET_DYNAMIC_CONFIG => {
                if payload.len() < 3 {
                    self.respond(STATUS_ERROR, &[]);
                } else {
                    let value = u16::from_le_bytes([payload[1], payload[2]]);
                    self.dynamic_config.insert(payload[0], value);
                    self.respond(STATUS_OK, &[]);
                }
            }
            CMD_GET_DATA_LOCATION => {
                match payload.first().and_then(|a| self.data_locations.get(a)).copied() {
                    Some((addr, len)) => {
                        let mut resp = addr.to_le_bytes().to_vec();
                        resp.extend_from_slice(&len.to_le_bytes());
                        self.respond(STATUS_OK, &resp);
                    }
                    None => self.respond(STATUS_ERROR, &[]),
                }
            }
            CMD_GET_FEATURES => {
                let features = self.features.clone();
                self.respond(STATUS_OK, &features);
            }
            CMD_GET_STATIC_CONFIG => {
                let config = self.static_config.clone();
                self.respond(STATUS_OK, &config);
            }
            CMD_SET_STATIC_CONFIG => {
                if payload.len() == self.static_config.len() {
                    self.static_config = payload.to_vec();
                    self.respond(STATUS_OK, &[]);
                } else {
                    self.respond(STATUS_ERROR, &[]);
                }
            }
            CMD_ENTER_DEEP_SLEEP => {
                self.sleeping = true;
                self.respond(STATUS_OK, &[]);
            }
            CMD_EXIT_DEEP_SLEEP => {
                self.sleeping = false;
                self.respond(STATUS_OK, &[]);
            }
            CMD_REZERO | CMD_ROMBOOT_DOWNLOAD => self.respond(STATUS_OK, &[]),
            _ => self.respond(STATUS_NOT_IMPLEMENTED, &[]),
        }
    }

    fn switch_mode(&mut self, mode: u8) {
        if !self.stuck_mode {
            self.mode = mode;
        }
        self.report_identify();
    }
}

pub struct SimulatedController {
    state: Mutex<SimState>,
    bus_type: BusType,
}

impl SimulatedController {
    /// Controller powered on in application firmware, identify report pending.
    pub fn new() -> Self {
        Self::with_boot_mode(FirmwareMode::Application)
    }

    pub fn with_boot_mode(mode: FirmwareMode) -> Self {
        let mut part_number = [0u8; 16];
        part_number[..5].copy_from_slice(b"S3907");
        let mut state = SimState {
            powered: true,
            in_reset: false,
            mode: mode.code(),
            boot_mode: mode.code(),
            identify: IdentifyInfo {
                version: 2,
                mode,
                part_number,
                build_id: 3_318_382,
                max_write_size: 0,
            },
            app_info: AppInfo {
                version: 1,
                status: APP_STATUS_OK,
                static_config_size: 64,
                dynamic_config_size: 32,
                max_x: 1079,
                max_y: 2399,
                max_objects: 10,
                num_of_image_rows: 36,
                num_of_image_cols: 16,
                ..Default::default()
            },
            boot_info: vec![1, 0, 0x07, 0x39, 4, 0x00, 0x02, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0, 0],
            romboot_info: vec![1, 0, 0x07, 0x39, 4, 0x00, 0x04, 0, 0, 0, 0],
            features: vec![0x00, 0x00, 0x01, 0x00],
            static_config: (0..64u8).collect(),
            dynamic_config: HashMap::new(),
            data_locations: HashMap::from([
                (LCM_DATA, (0x0400, 0x0040)),
                (OEM_DATA, (0x0480, 0x0100)),
                (PPDT_DATA, (0x0600, 0x0020)),
            ]),
            sleeping: false,
            outbox: VecDeque::new(),
            current: None,
            pending: None,
            silent: false,
            bad_markers: 0,
            read_errors: 0,
            stuck_mode: false,
            booting_polls: 0,
            irq_available: false,
            commands: Vec::new(),
            write_chunks: Vec::new(),
            hardware_resets: 0,
        };
        state.report_identify();
        Self {
            state: Mutex::new(state),
            bus_type: BusType::Spi,
        }
    }

    pub fn with_bus_type(mut self, bus_type: BusType) -> Self {
        self.bus_type = bus_type;
        self
    }

    /// Limit the write chunk size announced in identify reports.
    pub fn with_max_write_size(self, size: u16) -> Self {
        {
            let mut st = self.lock();
            st.identify.max_write_size = size;
            st.requeue_power_on_report();
        }
        self
    }

    pub fn with_irq_available(self, available: bool) -> Self {
        self.lock().irq_available = available;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an unsolicited report.
    pub fn push_report(&self, code: u8, payload: &[u8]) {
        self.lock().outbox.push_back(frame(code, payload));
    }

    /// Stop answering commands (they are still recorded).
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Corrupt the marker of the next `count` message reads.
    pub fn inject_bad_markers(&self, count: u32) {
        self.lock().bad_markers = count;
    }

    /// Fail the next `count` bus reads.
    pub fn inject_read_errors(&self, count: u32) {
        self.lock().read_errors = count;
    }

    /// Ignore mode-switch commands (still emitting identify reports).
    pub fn set_stuck_mode(&self, stuck: bool) {
        self.lock().stuck_mode = stuck;
    }

    /// Report "booting" for the next `count` application info queries.
    pub fn set_booting_polls(&self, count: u32) {
        self.lock().booting_polls = count;
    }

    pub fn set_dynamic_config(&self, id: u8, value: u16) {
        self.lock().dynamic_config.insert(id, value);
    }

    pub fn dynamic_config(&self, id: u8) -> Option<u16> {
        self.lock().dynamic_config.get(&id).copied()
    }

    pub fn set_data_location(&self, area: u8, addr: u16, len: u16) {
        self.lock().data_locations.insert(area, (addr, len));
    }

    pub fn mode(&self) -> FirmwareMode {
        FirmwareMode::from_code(self.lock().mode)
    }

    pub fn is_sleeping(&self) -> bool {
        self.lock().sleeping
    }

    /// Commands executed so far, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.lock().commands.clone()
    }

    /// Raw write transactions seen on the bus.
    pub fn write_chunks(&self) -> Vec<Vec<u8>> {
        self.lock().write_chunks.clone()
    }

    pub fn hardware_resets(&self) -> u32 {
        self.lock().hardware_resets
    }

    pub fn pending_messages(&self) -> usize {
        let st = self.lock();
        st.outbox.len() + usize::from(st.current.is_some())
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

impl TcmBus for SimulatedController {
    fn read(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut st = self.lock();

        if st.read_errors > 0 {
            st.read_errors -= 1;
            return Err(TransportError::ReadFailed("injected read error".into()));
        }
        if !st.powered || st.in_reset {
            buf.fill(0);
            return Ok(());
        }

        if let Some((msg, delivered)) = st.current.take() {
            if buf.len() < READ_CHUNK_OVERHEAD {
                buf.fill(MESSAGE_MARKER);
                st.current = Some((msg, delivered));
                return Ok(());
            }
            buf[0] = MESSAGE_MARKER;
            buf[1] = STATUS_CONTINUED_READ;
            let body = &mut buf[READ_CHUNK_OVERHEAD..];
            body.fill(MESSAGE_PADDING);
            let rest = &msg[delivered.min(msg.len())..];
            let n = rest.len().min(body.len());
            body[..n].copy_from_slice(&rest[..n]);
            let delivered = delivered + body.len();
            if delivered + 1 < msg.len() {
                st.current = Some((msg, delivered));
            }
            return Ok(());
        }

        // Short probes (watchdog) see the marker and consume nothing.
        if buf.len() < MESSAGE_HEADER_SIZE {
            buf.fill(MESSAGE_MARKER);
            return Ok(());
        }

        buf.fill(0);
        if st.bad_markers > 0 {
            st.bad_markers -= 1;
            return Ok(());
        }

        let Some(msg) = st.outbox.pop_front() else {
            buf[0] = MESSAGE_MARKER;
            buf[1] = STATUS_IDLE;
            return Ok(());
        };

        let n = msg.len().min(buf.len());
        buf[..n].copy_from_slice(&msg[..n]);
        if n + 1 < msg.len() {
            st.current = Some((msg, n));
        }
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut st = self.lock();
        st.write_chunks.push(data.to_vec());
        if !st.powered || st.in_reset || data.is_empty() {
            return Ok(());
        }

        if let Some(pending) = st.pending.as_mut().filter(|_| data[0] == CMD_CONTINUE_WRITE) {
            pending.stream.extend_from_slice(&data[1..]);
        } else {
            st.pending = Some(PendingCommand {
                command: data[0],
                stream: data[1..].to_vec(),
            });
        }

        let ready = st
            .pending
            .as_ref()
            .and_then(|p| p.payload().map(|payload| (p.command, payload.to_vec())));
        if let Some((command, payload)) = ready {
            st.pending = None;
            st.execute(command, &payload);
        }
        Ok(())
    }

    fn bus_type(&self) -> BusType {
        self.bus_type
    }
}

impl HardwareControl for SimulatedController {
    fn set_reset(&self, active: bool) -> Result<(), TransportError> {
        let mut st = self.lock();
        if active {
            st.in_reset = true;
            st.outbox.clear();
            st.current = None;
            st.pending = None;
        } else if st.in_reset {
            st.in_reset = false;
            st.hardware_resets += 1;
            st.reboot();
        }
        Ok(())
    }

    fn set_power(&self, on: bool) -> Result<(), TransportError> {
        let mut st = self.lock();
        if on && !st.powered {
            st.powered = true;
            st.reboot();
        } else if !on {
            st.powered = false;
            st.outbox.clear();
            st.current = None;
        }
        Ok(())
    }

    fn irq_available(&self) -> bool {
        self.lock().irq_available
    }

    fn attention_asserted(&self) -> bool {
        let st = self.lock();
        !st.outbox.is_empty() || st.current.is_some()
    }
}
