//! Touch-mode broker between userspace gesture requests and panel drivers.
//!
//! Up to two touch drivers (primary and secondary panel) register as clients.
//! Userspace enables oneshot gesture sensors here; the broker pushes the
//! requested set into the active driver a short while after the panel
//! blanks, and collects the gesture events drivers report back.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::device::lock;
use crate::error::{Result, TcmError};
use crate::worker::DelayedWork;

/// Delay between a panel blank or enable request and the driver update.
pub const SENSOR_ENABLE_DELAY: Duration = Duration::from_millis(300);

pub const FOLD_STATUS_UNFOLDED: i32 = 0;
pub const FOLD_STATUS_FOLDED: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TouchId {
    Primary,
    Secondary,
}

impl TouchId {
    pub fn index(&self) -> usize {
        match self {
            TouchId::Primary => 0,
            TouchId::Secondary => 1,
        }
    }

    fn fold_status(&self) -> i32 {
        match self {
            TouchId::Primary => FOLD_STATUS_UNFOLDED,
            TouchId::Secondary => FOLD_STATUS_FOLDED,
        }
    }
}

impl fmt::Display for TouchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TouchId::Primary => write!(f, "primary"),
            TouchId::Secondary => write!(f, "secondary"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TouchMode {
    ReportRate,
    FodFingerState,
    /// Pocket / non-UI state.
    NonuiMode,
    FoldStatus,
    SingletapGesture,
    DoubletapGesture,
    FodPressGesture,
}

/// Gesture sensors that fire once per event and re-arm on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OneshotSensor {
    SingleTap,
    DoubleTap,
    FodPress,
}

impl OneshotSensor {
    pub const ALL: [OneshotSensor; 3] = [
        OneshotSensor::SingleTap,
        OneshotSensor::DoubleTap,
        OneshotSensor::FodPress,
    ];

    pub fn mode(&self) -> TouchMode {
        match self {
            OneshotSensor::SingleTap => TouchMode::SingletapGesture,
            OneshotSensor::DoubleTap => TouchMode::DoubletapGesture,
            OneshotSensor::FodPress => TouchMode::FodPressGesture,
        }
    }

    fn index(&self) -> usize {
        match self {
            OneshotSensor::SingleTap => 0,
            OneshotSensor::DoubleTap => 1,
            OneshotSensor::FodPress => 2,
        }
    }
}

/// Touch driver side of the broker.
pub trait TouchModeClient: Send + Sync {
    fn set_mode_value(&self, mode: TouchMode, value: i32) -> Result<()>;
    fn get_mode_value(&self, mode: TouchMode) -> Result<i32>;
}

type SensorSet = [AtomicI32; 3];

struct BrokerState {
    clients: [Option<Arc<dyn TouchModeClient>>; 2],
    active: TouchId,
}

pub struct TouchModeBroker {
    state: Mutex<BrokerState>,
    /// Sensor enables requested by userspace.
    requested: SensorSet,
    /// Sensor enables last pushed into each driver.
    enabled: [SensorSet; 2],
    /// Gesture events not yet read.
    pending: SensorSet,
    suspended: AtomicBool,
    fod_finger_state: AtomicI32,
    pocket_disable_gestures: AtomicI32,
    enable_delay: Duration,
    enable_work: DelayedWork,
}

fn sensor_set() -> SensorSet {
    [AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)]
}

fn snapshot(set: &SensorSet) -> [i32; 3] {
    [
        set[0].load(Ordering::SeqCst),
        set[1].load(Ordering::SeqCst),
        set[2].load(Ordering::SeqCst),
    ]
}

impl TouchModeBroker {
    pub fn new() -> Arc<Self> {
        Self::with_enable_delay(SENSOR_ENABLE_DELAY)
    }

    pub fn with_enable_delay(enable_delay: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TouchModeBroker>| {
            let weak = weak.clone();
            Self {
                state: Mutex::new(BrokerState {
                    clients: [None, None],
                    active: TouchId::Primary,
                }),
                requested: sensor_set(),
                enabled: [sensor_set(), sensor_set()],
                pending: sensor_set(),
                suspended: AtomicBool::new(false),
                fod_finger_state: AtomicI32::new(0),
                pocket_disable_gestures: AtomicI32::new(0),
                enable_delay,
                enable_work: DelayedWork::new("touch-sensor-enable", move || {
                    if let Some(broker) = weak.upgrade() {
                        broker.apply_requested();
                    }
                }),
            }
        })
    }

    pub fn register_client(&self, id: TouchId, client: Arc<dyn TouchModeClient>) -> Result<()> {
        let mut state = lock(&self.state);
        let slot = &mut state.clients[id.index()];
        if slot.is_some() {
            return Err(TcmError::InvalidArgument(format!(
                "{id} touch client already registered"
            )));
        }
        *slot = Some(client);
        info!(touch = %id, "Touch client registered");
        Ok(())
    }

    pub fn unregister_client(&self, id: TouchId) {
        lock(&self.state).clients[id.index()] = None;
        info!(touch = %id, "Touch client unregistered");
    }

    pub fn active_touch_id(&self) -> TouchId {
        lock(&self.state).active
    }

    fn client(&self, id: TouchId) -> Option<Arc<dyn TouchModeClient>> {
        lock(&self.state).clients[id.index()].clone()
    }

    fn active_client(&self) -> Result<Arc<dyn TouchModeClient>> {
        let state = lock(&self.state);
        state.clients[state.active.index()]
            .clone()
            .ok_or_else(|| TcmError::NoTouchClient(state.active.to_string()))
    }

    /// Record a gesture event from a driver. Dropped in pocket mode.
    pub fn notify_oneshot_sensor(&self, sensor: OneshotSensor, value: i32) {
        if self.pocket_disable_gestures.load(Ordering::SeqCst) != 0 {
            info!(?sensor, value, "Gesture ignored in pocket mode");
            return;
        }
        self.pending[sensor.index()].store(value, Ordering::SeqCst);
    }

    /// Read a sensor's event state; a pending event is consumed.
    pub fn take_sensor_status(&self, sensor: OneshotSensor) -> i32 {
        match self.pending[sensor.index()].compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(old) | Err(old) => old,
        }
    }

    pub fn sensor_enabled(&self, sensor: OneshotSensor) -> bool {
        self.requested[sensor.index()].load(Ordering::SeqCst) != 0
    }

    pub fn set_sensor_enabled(&self, sensor: OneshotSensor, enable: bool) {
        let value = i32::from(enable);
        if self.requested[sensor.index()].swap(value, Ordering::SeqCst) != value {
            debug!(?sensor, enable, "Sensor request changed");
            self.enable_work.cancel_sync();
            self.enable_work.schedule(self.enable_delay);
        }
    }

    pub fn panel_blank(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        self.enable_work.schedule(self.enable_delay);
    }

    pub fn panel_unblank(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        self.enable_work.cancel_sync();
    }

    /// Wait for a scheduled driver update to finish.
    pub fn flush(&self) {
        self.enable_work.flush();
    }

    fn apply_requested(&self) {
        if self.suspended.load(Ordering::SeqCst) {
            let active = self.active_touch_id();
            self.update_driver(active, true, snapshot(&self.requested));
        }
    }

    /// Push `requested` (or all-off) into driver `id`, touching only the
    /// sensors whose value changed.
    fn update_driver(&self, id: TouchId, enabled: bool, requested: [i32; 3]) {
        let Some(client) = self.client(id) else {
            return;
        };

        for sensor in OneshotSensor::ALL {
            let value = if enabled { requested[sensor.index()] } else { 0 };
            if self.enabled[id.index()][sensor.index()].swap(value, Ordering::SeqCst) != value {
                info!(touch = %id, ?sensor, value, "Updating gesture");
                if let Err(e) = client.set_mode_value(sensor.mode(), value) {
                    info!(touch = %id, ?sensor, error = %e, "Failed to update gesture");
                }
            }
        }
    }

    pub fn get_mode(&self, mode: TouchMode) -> Result<i32> {
        match mode {
            TouchMode::FodFingerState => Ok(self.fod_finger_state.load(Ordering::SeqCst)),
            TouchMode::NonuiMode => Ok(self.pocket_disable_gestures.load(Ordering::SeqCst)),
            TouchMode::FoldStatus => Ok(self.active_touch_id().fold_status()),
            _ => self.active_client()?.get_mode_value(mode),
        }
    }

    pub fn set_mode(&self, mode: TouchMode, value: i32) -> Result<()> {
        match mode {
            TouchMode::FodFingerState => {
                self.fod_finger_state.store(value, Ordering::SeqCst);
                Ok(())
            }
            TouchMode::NonuiMode => {
                self.pocket_disable_gestures.store(value, Ordering::SeqCst);
                Ok(())
            }
            TouchMode::FoldStatus => {
                let requested = match value {
                    FOLD_STATUS_UNFOLDED => TouchId::Primary,
                    FOLD_STATUS_FOLDED => TouchId::Secondary,
                    other => {
                        return Err(TcmError::InvalidArgument(format!(
                            "fold status {other}"
                        )));
                    }
                };
                self.switch_active(requested);
                Ok(())
            }
            _ => self.active_client()?.set_mode_value(mode, value),
        }
    }

    /// Move the gesture set from the active driver to `requested`.
    fn switch_active(&self, requested: TouchId) {
        let previous = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut state.active, requested)
        };
        if previous == requested {
            return;
        }

        info!(from = %previous, to = %requested, "Active touch panel changed");
        let carried = snapshot(&self.enabled[previous.index()]);
        self.update_driver(requested, true, carried);
        self.update_driver(previous, false, [0; 3]);
    }
}
