//! Pluggable modules notified of reports and lifecycle events.
//!
//! Registration requests are queued as intents and applied by a dedicated
//! worker, so the list is never mutated by the caller while a report fan-out
//! may be iterating it. Reports are delivered in registration order with the
//! list lock held; lifecycle callbacks run on a snapshot outside the lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::dispatch::Report;
use crate::error::{Result, TcmError};
use crate::worker::DelayedWork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
    Touch,
    Device,
    Testing,
    Reflash,
    Recovery,
    ZeroFlash,
    Diagnostics,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleType::Touch => write!(f, "touch"),
            ModuleType::Device => write!(f, "device"),
            ModuleType::Testing => write!(f, "testing"),
            ModuleType::Reflash => write!(f, "reflash"),
            ModuleType::Recovery => write!(f, "recovery"),
            ModuleType::ZeroFlash => write!(f, "zeroflash"),
            ModuleType::Diagnostics => write!(f, "diagnostics"),
        }
    }
}

/// Callbacks a module may implement. All default to no-ops.
///
/// `on_report` runs with the registry lock held and blocks every later
/// report until it returns. Errors stay inside the module.
pub trait TcmModule: Send + Sync {
    fn module_type(&self) -> ModuleType;

    fn init(&self) {}

    fn remove(&self) {}

    fn reinit(&self) {}

    fn on_report(&self, _report: &Report<'_>) {}

    fn on_async_report(&self, _id: u8) {}

    fn early_suspend(&self) {}

    fn suspend(&self) {}

    fn resume(&self) {}
}

struct ModuleHandle {
    module: Arc<dyn TcmModule>,
    pending_insert: bool,
    pending_remove: bool,
}

impl ModuleHandle {
    fn is_active(&self) -> bool {
        !self.pending_insert && !self.pending_remove
    }
}

enum Intent {
    Add(Arc<dyn TcmModule>),
    Remove(ModuleType),
}

pub struct ModuleRegistry {
    modules: Mutex<Vec<ModuleHandle>>,
    intents: Mutex<VecDeque<Intent>>,
    initialized: AtomicBool,
    init_wait: Duration,
    init_max: Duration,
    worker: DelayedWork,
}

impl ModuleRegistry {
    pub fn new(init_wait: Duration, init_max: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            Self {
                modules: Mutex::new(Vec::new()),
                intents: Mutex::new(VecDeque::new()),
                initialized: AtomicBool::new(false),
                init_wait,
                init_max,
                worker: DelayedWork::new("tcm-modules", move || {
                    if let Some(registry) = weak.upgrade() {
                        registry.process_intents();
                    }
                }),
            }
        })
    }

    fn lock_modules(&self) -> MutexGuard<'_, Vec<ModuleHandle>> {
        self.modules.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_intents(&self) -> MutexGuard<'_, VecDeque<Intent>> {
        self.intents.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The core finished probing; queued registrations may now be applied.
    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        self.worker.schedule(Duration::ZERO);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn wait_initialized(&self) -> Result<()> {
        let deadline = Instant::now() + self.init_max;
        while !self.is_initialized() {
            if Instant::now() >= deadline {
                warn!("Module registry not initialized");
                return Err(TcmError::RegistryNotReady);
            }
            thread::sleep(self.init_wait);
        }
        Ok(())
    }

    /// Queue a module for insertion. `init` runs later on the registry worker.
    pub fn register(&self, module: Arc<dyn TcmModule>) -> Result<()> {
        self.wait_initialized()?;
        debug!(module = %module.module_type(), "Queue module insert");
        self.lock_intents().push_back(Intent::Add(module));
        self.worker.schedule(Duration::ZERO);
        Ok(())
    }

    /// Queue removal of the module of `module_type`.
    pub fn unregister(&self, module_type: ModuleType) -> Result<()> {
        self.wait_initialized()?;
        debug!(module = %module_type, "Queue module remove");
        self.lock_intents().push_back(Intent::Remove(module_type));
        self.worker.schedule(Duration::ZERO);
        Ok(())
    }

    /// Wait until every queued intent has been applied.
    pub fn flush(&self) {
        self.worker.flush();
    }

    fn process_intents(&self) {
        loop {
            let Some(intent) = self.lock_intents().pop_front() else {
                break;
            };
            match intent {
                Intent::Add(module) => self.insert(module),
                Intent::Remove(module_type) => self.remove(module_type),
            }
        }
    }

    fn insert(&self, module: Arc<dyn TcmModule>) {
        let module_type = module.module_type();
        {
            let mut modules = self.lock_modules();
            if modules
                .iter()
                .any(|h| h.module.module_type() == module_type && !h.pending_remove)
            {
                warn!(module = %module_type, "Module already registered");
                return;
            }
            modules.push(ModuleHandle {
                module: module.clone(),
                pending_insert: true,
                pending_remove: false,
            });
        }

        module.init();

        let mut modules = self.lock_modules();
        if let Some(handle) = modules
            .iter_mut()
            .find(|h| Arc::ptr_eq(&h.module, &module))
        {
            handle.pending_insert = false;
        }
        info!(module = %module_type, "Module inserted");
    }

    fn remove(&self, module_type: ModuleType) {
        let module = {
            let mut modules = self.lock_modules();
            let Some(handle) = modules
                .iter_mut()
                .find(|h| h.module.module_type() == module_type && !h.pending_remove)
            else {
                warn!(module = %module_type, "Module not registered");
                return;
            };
            handle.pending_remove = true;
            handle.module.clone()
        };

        module.remove();

        self.lock_modules()
            .retain(|h| !Arc::ptr_eq(&h.module, &module));
        info!(module = %module_type, "Module removed");
    }

    /// Deliver a report to every active module, in registration order.
    pub fn dispatch_report(&self, report: &Report<'_>) {
        let modules = self.lock_modules();
        for handle in modules.iter().filter(|h| h.is_active()) {
            handle.module.on_report(report);
        }
    }

    pub fn dispatch_async_report(&self, id: u8) {
        let modules = self.lock_modules();
        for handle in modules.iter().filter(|h| h.is_active()) {
            handle.module.on_async_report(id);
        }
    }

    fn active_modules(&self) -> Vec<Arc<dyn TcmModule>> {
        self.lock_modules()
            .iter()
            .filter(|h| h.is_active())
            .map(|h| h.module.clone())
            .collect()
    }

    pub fn reinit_all(&self) {
        for module in self.active_modules() {
            module.reinit();
        }
    }

    pub fn early_suspend_all(&self) {
        for module in self.active_modules() {
            module.early_suspend();
        }
    }

    pub fn suspend_all(&self) {
        for module in self.active_modules() {
            module.suspend();
        }
    }

    pub fn resume_all(&self) {
        for module in self.active_modules() {
            module.resume();
        }
    }

    /// Types of the active modules, in registration order.
    pub fn module_types(&self) -> Vec<ModuleType> {
        self.active_modules()
            .iter()
            .map(|module| module.module_type())
            .collect()
    }

    pub fn contains(&self, module_type: ModuleType) -> bool {
        self.lock_modules()
            .iter()
            .any(|h| h.is_active() && h.module.module_type() == module_type)
    }

    pub fn len(&self) -> usize {
        self.lock_modules().iter().filter(|h| h.is_active()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Module recording the callbacks it receives.
    pub(crate) struct RecordingModule {
        pub kind: ModuleType,
        pub log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingModule {
        pub(crate) fn new(kind: ModuleType, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                log: log.clone(),
            })
        }

        fn push(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.kind, what));
        }
    }

    impl TcmModule for RecordingModule {
        fn module_type(&self) -> ModuleType {
            self.kind
        }
        fn init(&self) {
            self.push("init");
        }
        fn remove(&self) {
            self.push("remove");
        }
        fn reinit(&self) {
            self.push("reinit");
        }
        fn on_report(&self, report: &Report<'_>) {
            self.push(&format!("report{:02X}/{}", report.id, report.payload.len()));
        }
        fn on_async_report(&self, id: u8) {
            self.push(&format!("async{:02X}", id));
        }
        fn early_suspend(&self) {
            self.push("early_suspend");
        }
        fn suspend(&self) {
            self.push("suspend");
        }
        fn resume(&self) {
            self.push("resume");
        }
    }

    fn ready_registry() -> Arc<ModuleRegistry> {
        let registry = ModuleRegistry::new(Duration::from_millis(1), Duration::from_millis(20));
        registry.mark_initialized();
        registry
    }

    #[test]
    fn test_reports_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ready_registry();
        registry
            .register(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        registry
            .register(RecordingModule::new(ModuleType::Reflash, &log))
            .unwrap();
        registry.flush();
        log.lock().unwrap().clear();

        registry.dispatch_report(&Report {
            id: 0x12,
            payload: &[1, 2, 3],
        });
        assert_eq!(
            *log.lock().unwrap(),
            vec!["testing:report12/3", "reflash:report12/3"]
        );
    }

    #[test]
    fn test_init_and_remove_run_on_worker() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ready_registry();
        registry
            .register(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        registry.flush();
        assert!(registry.contains(ModuleType::Testing));

        registry.unregister(ModuleType::Testing).unwrap();
        registry.flush();
        assert!(!registry.contains(ModuleType::Testing));
        assert!(registry.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["testing:init", "testing:remove"]);
    }

    #[test]
    fn test_duplicate_type_ignored() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ready_registry();
        registry
            .register(RecordingModule::new(ModuleType::Device, &log))
            .unwrap();
        registry
            .register(RecordingModule::new(ModuleType::Device, &log))
            .unwrap();
        registry.flush();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_before_init_times_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ModuleRegistry::new(Duration::from_millis(1), Duration::from_millis(10));
        let err = registry
            .register(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap_err();
        assert!(matches!(err, TcmError::RegistryNotReady));
    }

    #[test]
    fn test_register_waits_for_init() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ModuleRegistry::new(Duration::from_millis(1), Duration::from_millis(500));
        let r = registry.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            r.mark_initialized();
        });
        registry
            .register(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        handle.join().unwrap();
        registry.flush();
        assert!(registry.contains(ModuleType::Testing));
    }

    #[test]
    fn test_lifecycle_fan_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ready_registry();
        registry
            .register(RecordingModule::new(ModuleType::Testing, &log))
            .unwrap();
        registry.flush();
        log.lock().unwrap().clear();

        registry.suspend_all();
        registry.resume_all();
        registry.reinit_all();
        registry.dispatch_async_report(0x1B);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "testing:suspend",
                "testing:resume",
                "testing:reinit",
                "testing:async1B"
            ]
        );
    }
}
