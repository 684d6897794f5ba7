//! Device instance and its public handle.
//!
//! `Core` owns the transport, command engine, module registry and the
//! background workers (polling, watchdog, helper, report notifier). Workers
//! hold a weak reference, so dropping the last `TcmDevice` tears everything
//! down. `TcmDevice` is the cloneable handle platform code and modules use.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, TryLockError, Weak};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::broker::{TouchId, TouchModeBroker};
use crate::command::{CommandEngine, CommandState, Response};
use crate::config::DriverConfig;
use crate::dispatch::TouchReportHandler;
use crate::error::{Result, TcmError};
use crate::events::{TcmObserver, TracingObserver};
use crate::framer::{MessageFramer, ReadOutcome};
use crate::protocol::constants::*;
use crate::protocol::{DataLocation, DynamicConfigId, FirmwareMode, FlashArea};
use crate::registry::{ModuleRegistry, ModuleType, TcmModule};
use crate::state::{DeviceIdentity, Features, SensorType};
use crate::transport::{
    BusType, ChunkedTransport, HardwareControl, ObservableBus, TcmBus, TransportBuffer,
};
use crate::worker::DelayedWork;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Non-blocking lock; `None` while another thread holds it.
pub(crate) fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Work handed to the single-slot helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperTask {
    RunApplicationFirmware,
    SendReinitNotification,
    TouchReinit,
    SendRombootHdl,
}

macro_rules! flags {
    ($($name:ident / $setter:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub(crate) struct Flags {
            $($name: AtomicBool,)*
        }

        impl Flags {
            $(
                pub(crate) fn $name(&self) -> bool {
                    self.$name.load(Ordering::SeqCst)
                }

                pub(crate) fn $setter(&self, value: bool) {
                    self.$name.store(value, Ordering::SeqCst);
                }
            )*
        }
    };
}

flags! {
    irq_enabled / set_irq_enabled,
    do_polling / set_do_polling,
    in_hdl_mode / set_in_hdl_mode,
    in_suspend / set_in_suspend,
    in_suspending / set_in_suspending,
    in_sleep / set_in_sleep,
    panel_off / set_panel_off,
    watchdog_running / set_watchdog_running,
}

/// Wakeup gesture selection made through the touch-mode broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GestureState {
    pub doubletap: bool,
    /// Single tap, used for always-on display.
    pub aod: bool,
    pub fod: bool,
    /// A finger currently rests on the fingerprint area.
    pub fod_finger: bool,
    /// 0 normal, 1 pocket with FOD kept, 2 pocket.
    pub nonui_status: i32,
    /// Gestures stay armed through the current suspend.
    pub wakeup_enabled: bool,
    /// Last value written to GESTURE_TYPE_ENABLE.
    pub gesture_type: u16,
}

impl GestureState {
    pub fn any_requested(&self) -> bool {
        self.doubletap || self.aod || self.fod
    }
}

pub(crate) struct Core {
    pub(crate) config: DriverConfig,
    pub(crate) observer: Arc<dyn TcmObserver>,
    pub(crate) transport: Arc<ChunkedTransport>,
    pub(crate) framer: MessageFramer,
    pub(crate) engine: CommandEngine,
    pub(crate) registry: Arc<ModuleRegistry>,
    pub(crate) hw: Option<Arc<dyn HardwareControl>>,
    identity: RwLock<DeviceIdentity>,
    touch: RwLock<Option<Arc<dyn TouchReportHandler>>>,
    pub(crate) flags: Flags,
    pub(crate) gestures: Mutex<GestureState>,
    pub(crate) charger: Mutex<Option<bool>>,
    pub(crate) watchdog_count: AtomicU32,
    pub(crate) async_report_id: AtomicU8,
    pub(crate) helper_task: Mutex<Option<HelperTask>>,
    pub(crate) host_download: Mutex<bool>,
    pub(crate) host_download_done: Condvar,
    config_buf: Mutex<TransportBuffer>,
    pub(crate) reset_lock: Mutex<()>,
    pub(crate) identify_lock: Mutex<()>,
    pub(crate) irq_lock: Mutex<()>,
    pub(crate) esd_lock: Mutex<()>,
    pub(crate) broker: Mutex<Option<(Weak<TouchModeBroker>, TouchId)>>,
    pub(crate) polling: Arc<DelayedWork>,
    pub(crate) watchdog: DelayedWork,
    pub(crate) helper: DelayedWork,
    pub(crate) notifier: DelayedWork,
}

impl Core {
    fn new(
        bus: Arc<dyn TcmBus>,
        hw: Option<Arc<dyn HardwareControl>>,
        config: DriverConfig,
        observer: Arc<dyn TcmObserver>,
    ) -> Arc<Self> {
        let bus: Arc<dyn TcmBus> = Arc::new(ObservableBus::new(bus, observer.clone()));
        let transport = Arc::new(
            ChunkedTransport::new(bus, config.rd_chunk_size, config.wr_chunk_size)
                .with_write_delay(config.write_delay_us_min, config.write_delay_us_max),
        );
        let engine = CommandEngine::new(
            transport.clone(),
            observer.clone(),
            ms(config.response_timeout_ms),
            ms(config.polling_delay_ms),
        );
        let registry = ModuleRegistry::new(
            ms(config.registry_init_wait_ms),
            ms(config.registry_init_max_ms),
        );
        let framer = MessageFramer::from_config(&config);

        Arc::new_cyclic(|weak: &Weak<Core>| {
            let work = |name: &'static str, run: fn(&Core)| {
                let weak = weak.clone();
                DelayedWork::new(name, move || {
                    if let Some(core) = weak.upgrade() {
                        run(&core);
                    }
                })
            };

            Self {
                config,
                observer,
                transport,
                framer,
                engine,
                registry,
                hw,
                identity: RwLock::new(DeviceIdentity::default()),
                touch: RwLock::new(None),
                flags: Flags::default(),
                gestures: Mutex::new(GestureState::default()),
                charger: Mutex::new(None),
                watchdog_count: AtomicU32::new(0),
                async_report_id: AtomicU8::new(0),
                helper_task: Mutex::new(None),
                host_download: Mutex::new(false),
                host_download_done: Condvar::new(),
                config_buf: Mutex::new(TransportBuffer::new()),
                reset_lock: Mutex::new(()),
                identify_lock: Mutex::new(()),
                irq_lock: Mutex::new(()),
                esd_lock: Mutex::new(()),
                broker: Mutex::new(None),
                polling: Arc::new(work("tcm-polling", Core::polling_work)),
                watchdog: work("tcm-watchdog", Core::watchdog_work),
                helper: work("tcm-helper", Core::run_helper),
                notifier: work("tcm-notifier", Core::notify_async_report),
            }
        })
    }

    /// Snapshot of the identity; never hold it across a command.
    pub(crate) fn identity(&self) -> DeviceIdentity {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn mode(&self) -> FirmwareMode {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .mode()
    }

    pub(crate) fn update_identity<R>(&self, f: impl FnOnce(&mut DeviceIdentity) -> R) -> R {
        let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
        f(&mut identity)
    }

    pub(crate) fn touch_handler(&self) -> Option<Arc<dyn TouchReportHandler>> {
        self.touch.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_touch_handler(&self, handler: Option<Arc<dyn TouchReportHandler>>) {
        *self.touch.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub(crate) fn app_ready(&self) -> bool {
        let identity = self.identity();
        identity.mode().is_firmware() && identity.app_status() == Some(APP_STATUS_OK)
    }

    fn apply_hdl_chunk_sizes(&self) {
        self.transport
            .set_rd_chunk_size(self.config.hdl_rd_chunk_size);
        self.transport
            .set_wr_chunk_size(self.config.hdl_wr_chunk_size);
    }

    /// Read the first message and classify the controller from it.
    ///
    /// Over SPI a missing marker means the controller only answers the F35
    /// recovery protocol, which the host download modules take over.
    #[instrument(level = "debug", skip(self))]
    fn detect_sensor(&self) -> Result<()> {
        self.flags.set_in_hdl_mode(false);
        self.update_identity(|identity| {
            identity.sensor_type = SensorType::Unknown;
            identity.is_detected = false;
        });

        let outcome = match self.read_and_dispatch() {
            Ok(outcome) => outcome,
            Err(TcmError::Framing { marker }) if self.transport.bus_type() == BusType::Spi => {
                info!(marker = %format!("0x{:02X}", marker), "No TouchComm marker, assuming F35");
                self.flags.set_in_hdl_mode(true);
                self.update_identity(|identity| {
                    identity.sensor_type = SensorType::F35;
                    identity.is_detected = true;
                });
                self.apply_hdl_chunk_sizes();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match outcome {
            ReadOutcome::Message(frame) if frame.code.value() == REPORT_IDENTIFY => {}
            ReadOutcome::Message(frame) => {
                return Err(TcmError::NotDetected(format!(
                    "unexpected code 0x{:02X}",
                    frame.code.value()
                )));
            }
            ReadOutcome::Control(code) => {
                return Err(TcmError::NotDetected(format!(
                    "no identify report (status 0x{:02X})",
                    code.value()
                )));
            }
        }

        let mode = self.mode();
        let sensor_type = match mode {
            FirmwareMode::RomBootloader => {
                self.flags.set_in_hdl_mode(true);
                self.apply_hdl_chunk_sizes();
                self.engine.set_host_download_mode(true);
                SensorType::RomBoot
            }
            FirmwareMode::Application => SensorType::Flash,
            other => {
                warn!(mode = %other, "Unexpected firmware mode at detection");
                SensorType::Unknown
            }
        };
        self.update_identity(|identity| {
            identity.is_detected = true;
            identity.sensor_type = sensor_type;
        });
        info!(mode = %mode, sensor = %sensor_type, bus = %self.transport.bus_type(), "Sensor detected");
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    fn probe(&self) -> Result<()> {
        if let Some(hw) = &self.hw {
            hw.set_power(true)?;
        }
        self.detect_sensor()?;

        if !self.flags.in_hdl_mode() {
            self.enable_irq(true);
            let ready = self.identify(false).and_then(|()| {
                if let Some(touch) = self.touch_handler() {
                    touch.init();
                }
                Ok(())
            });
            if let Err(e) = ready {
                warn!(error = %e, "Failed to bring up the controller");
                self.enable_irq(false);
                return Err(e);
            }
        }

        self.registry.mark_initialized();
        self.update_watchdog(true);
        info!("Probe complete");
        Ok(())
    }

    fn remove(&self) {
        self.update_watchdog(false);
        self.enable_irq(false);
        self.helper.cancel_sync();
        self.notifier.cancel_sync();

        if let Some((broker, id)) = lock(&self.broker).take()
            && let Some(broker) = broker.upgrade()
        {
            broker.unregister_client(id);
        }

        if self.registry.is_initialized() {
            for module_type in self.registry.module_types() {
                if let Err(e) = self.registry.unregister(module_type) {
                    warn!(module = %module_type, error = %e, "Failed to remove module");
                }
            }
            self.registry.flush();
        }
        info!("Device removed");
    }

    pub(crate) fn get_dynamic_config(&self, id: DynamicConfigId) -> Result<u16> {
        let response = self.engine.request(CMD_GET_DYNAMIC_CONFIG, &[id.value()])?;
        match response.payload.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            other => Err(TcmError::InvalidLength(format!(
                "{id} response is {} bytes",
                other.len()
            ))),
        }
    }

    pub(crate) fn set_dynamic_config(&self, id: DynamicConfigId, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.engine
            .request(CMD_SET_DYNAMIC_CONFIG, &[id.value(), lo, hi])?;
        debug!(id = %id, value, "Dynamic config set");
        Ok(())
    }

    pub(crate) fn sleep(&self, enter: bool) -> Result<()> {
        let command = if enter {
            CMD_ENTER_DEEP_SLEEP
        } else {
            CMD_EXIT_DEEP_SLEEP
        };
        self.engine.request(command, &[])?;
        debug!(enter, "Deep sleep");
        Ok(())
    }

    pub(crate) fn rezero(&self) -> Result<()> {
        self.engine.request(CMD_REZERO, &[])?;
        Ok(())
    }

    fn get_data_location(&self, area: FlashArea) -> Result<DataLocation> {
        let response = self
            .engine
            .request(CMD_GET_DATA_LOCATION, &[area.code()])?;
        match response.payload.as_slice() {
            [a0, a1, l0, l1] => Ok(DataLocation {
                addr: u16::from_le_bytes([*a0, *a1]),
                length: u16::from_le_bytes([*l0, *l1]),
            }),
            other => Err(TcmError::InvalidLength(format!(
                "{area} data location is {} bytes",
                other.len()
            ))),
        }
    }

    fn get_static_config(&self) -> Result<Vec<u8>> {
        let response = self.engine.request(CMD_GET_STATIC_CONFIG, &[])?;
        let len = response.payload.len();
        let mut config = lock(&self.config_buf);
        config.alloc(len);
        config.copy_in(0, &response.payload, len)?;
        config.set_data_length(len);
        Ok(config.data().to_vec())
    }

    fn set_static_config(&self, data: &[u8]) -> Result<()> {
        self.engine.request(CMD_SET_STATIC_CONFIG, data)?;
        let mut config = lock(&self.config_buf);
        config.alloc(data.len());
        config.copy_in(0, data, data.len())?;
        config.set_data_length(data.len());
        Ok(())
    }

    /// Read `len` bytes straight off the bus, bypassing the framer.
    fn raw_read(&self, len: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; len];
        self.transport.lock().raw_read(&mut data)?;
        Ok(data)
    }

    pub(crate) fn set_charger_connected(&self, connected: bool) -> Result<()> {
        *lock(&self.charger) = Some(connected);
        if self.flags.in_sleep() {
            debug!(connected, "In deep sleep, charger state deferred");
            return Ok(());
        }
        self.set_dynamic_config(DynamicConfigId::CHARGER_CONNECTED, u16::from(connected))
    }

    pub(crate) fn resend_charger_state(&self) {
        let Some(connected) = *lock(&self.charger) else {
            return;
        };
        if let Err(e) = self.set_charger_connected(connected) {
            warn!(connected, error = %e, "Failed to resend charger state");
        }
    }
}

/// Handle to a TouchComm controller.
///
/// Cloning is cheap; every clone drives the same device.
#[derive(Clone)]
pub struct TcmDevice {
    core: Arc<Core>,
}

impl TcmDevice {
    /// Device on `bus` without reset, power or interrupt lines.
    pub fn new(bus: Arc<dyn TcmBus>, config: DriverConfig) -> Self {
        Self::with_observer(bus, None, config, Arc::new(TracingObserver))
    }

    pub fn with_hardware(
        bus: Arc<dyn TcmBus>,
        hw: Arc<dyn HardwareControl>,
        config: DriverConfig,
    ) -> Self {
        Self::with_observer(bus, Some(hw), config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        bus: Arc<dyn TcmBus>,
        hw: Option<Arc<dyn HardwareControl>>,
        config: DriverConfig,
        observer: Arc<dyn TcmObserver>,
    ) -> Self {
        Self {
            core: Core::new(bus, hw, config, observer),
        }
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Power up, detect the controller, start reading and identify it.
    ///
    /// Modules may register once this returns.
    pub fn probe(&self) -> Result<()> {
        self.core.probe()
    }

    /// Stop every worker, detach from the broker and remove all modules.
    pub fn remove(&self) {
        self.core.remove()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.core.config
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.core.identity()
    }

    pub fn mode(&self) -> FirmwareMode {
        self.core.mode()
    }

    pub fn command_state(&self) -> CommandState {
        self.core.engine.state()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.core.registry
    }

    pub fn register_module(&self, module: Arc<dyn TcmModule>) -> Result<()> {
        self.core.registry.register(module)
    }

    pub fn unregister_module(&self, module_type: ModuleType) -> Result<()> {
        self.core.registry.unregister(module_type)
    }

    /// Install the consumer of touch reports.
    pub fn set_touch_handler(&self, handler: Arc<dyn TouchReportHandler>) {
        self.core.set_touch_handler(Some(handler));
    }

    pub fn clear_touch_handler(&self) {
        self.core.set_touch_handler(None);
    }

    /// Transactional command; any status code is returned to the caller.
    pub fn send_command(&self, command: u8, payload: &[u8]) -> Result<Response> {
        self.core.engine.send(command, payload)
    }

    /// Write a command without waiting for a response.
    pub fn send_raw(&self, command: u8, data: &[u8]) -> Result<()> {
        self.core.engine.send_raw(command, data)
    }

    pub fn raw_read(&self, len: usize) -> Result<Vec<u8>> {
        self.core.raw_read(len)
    }

    /// Send IDENTIFY and refresh the mode specific info block.
    pub fn identify(&self) -> Result<DeviceIdentity> {
        self.core.identify(true)?;
        Ok(self.core.identity())
    }

    pub fn get_dynamic_config(&self, id: DynamicConfigId) -> Result<u16> {
        self.core.get_dynamic_config(id)
    }

    pub fn set_dynamic_config(&self, id: DynamicConfigId, value: u16) -> Result<()> {
        self.core.set_dynamic_config(id, value)
    }

    pub fn get_data_location(&self, area: FlashArea) -> Result<DataLocation> {
        self.core.get_data_location(area)
    }

    pub fn get_static_config(&self) -> Result<Vec<u8>> {
        self.core.get_static_config()
    }

    pub fn set_static_config(&self, data: &[u8]) -> Result<()> {
        self.core.set_static_config(data)
    }

    pub fn get_features(&self) -> Result<Features> {
        self.core.get_features()
    }

    pub fn sleep(&self, enter: bool) -> Result<()> {
        self.core.sleep(enter)
    }

    pub fn rezero(&self) -> Result<()> {
        self.core.rezero()
    }

    /// Reset the controller and bring it back to application firmware.
    pub fn reset(&self, hardware: bool) -> Result<()> {
        self.core.reset_and_reinit(hardware, true)
    }

    pub fn switch_mode(&self, target: FirmwareMode) -> Result<()> {
        self.core.switch_mode(target)
    }

    /// Power cycle the controller, then hardware reset it.
    pub fn esd_recovery(&self) -> Result<()> {
        self.core.esd_recovery()
    }

    pub fn enable_irq(&self, enable: bool) {
        self.core.enable_irq(enable)
    }

    /// Attention interrupt entry point.
    pub fn handle_interrupt(&self) {
        self.core.handle_interrupt()
    }

    pub fn update_watchdog(&self, enable: bool) {
        self.core.update_watchdog(enable)
    }

    pub fn set_charger_connected(&self, connected: bool) -> Result<()> {
        self.core.set_charger_connected(connected)
    }

    pub fn gestures(&self) -> GestureState {
        *lock(&self.core.gestures)
    }

    pub fn set_fod_finger(&self, present: bool) {
        lock(&self.core.gestures).fod_finger = present;
    }

    pub fn is_suspended(&self) -> bool {
        self.core.flags.in_suspend()
    }

    pub fn is_sleeping(&self) -> bool {
        self.core.flags.in_sleep()
    }

    pub fn in_hdl_mode(&self) -> bool {
        self.core.flags.in_hdl_mode()
    }

    pub fn is_host_downloading(&self) -> bool {
        self.core.is_host_downloading()
    }

    /// Called by the download module when it starts or abandons a download.
    pub fn set_host_downloading(&self, active: bool) {
        self.core.set_host_downloading(active)
    }

    /// Called by the download module once the firmware runs; reinitializes
    /// everything and releases `wait_host_download`.
    pub fn notify_host_download_complete(&self) {
        self.core.schedule_helper(HelperTask::SendReinitNotification)
    }

    pub fn wait_host_download(&self) -> Result<()> {
        self.core.wait_host_download()
    }

    /// Deliver a payloadless report `id` to the modules.
    pub fn check_host_download(&self, id: u8) {
        self.core.check_host_download(id)
    }

    pub fn early_suspend(&self) -> Result<()> {
        self.core.early_suspend()
    }

    pub fn suspend(&self) {
        self.core.suspend()
    }

    pub fn resume(&self) -> Result<()> {
        self.core.resume()
    }

    /// Register with `broker` as the client for panel `id`.
    pub fn attach_touch_broker(&self, broker: &Arc<TouchModeBroker>, id: TouchId) -> Result<()> {
        broker.register_client(id, Arc::new(self.clone()))?;
        *lock(&self.core.broker) = Some((Arc::downgrade(broker), id));
        Ok(())
    }
}
