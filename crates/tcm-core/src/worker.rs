//! Cancellable delayed work on a dedicated thread.
//!
//! Each `DelayedWork` owns one thread running one closure. `schedule` arms a
//! deadline (no-op while one is already armed), `cancel_sync` disarms it and
//! waits for an in-flight run to finish, so no execution remains afterwards.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Default)]
struct WorkState {
    deadline: Option<Instant>,
    running: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WorkState>,
    cond: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct DelayedWork {
    name: &'static str,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DelayedWork {
    pub fn new<F>(name: &'static str, work: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker = shared.clone();
        let handle = thread::spawn(move || run(&worker, work));
        let thread_id = handle.thread().id();
        Self {
            name,
            shared,
            thread: Some(handle),
            thread_id,
        }
    }

    /// Arm the work to run after `delay`. Returns false if it was already pending.
    pub fn schedule(&self, delay: Duration) -> bool {
        let mut st = self.shared.lock();
        if st.shutdown || st.deadline.is_some() {
            return false;
        }
        st.deadline = Some(Instant::now() + delay);
        self.shared.cond.notify_all();
        trace!(work = self.name, delay_ms = delay.as_millis() as u64, "Scheduled");
        true
    }

    /// Arm or move the deadline to `delay` from now.
    pub fn reschedule(&self, delay: Duration) {
        let mut st = self.shared.lock();
        if st.shutdown {
            return;
        }
        st.deadline = Some(Instant::now() + delay);
        self.shared.cond.notify_all();
    }

    /// Disarm without waiting. Returns whether a run was pending.
    pub fn cancel(&self) -> bool {
        self.shared.lock().deadline.take().is_some()
    }

    /// Disarm and wait for a running execution to complete.
    ///
    /// Called from the work itself it only disarms.
    pub fn cancel_sync(&self) -> bool {
        let mut st = self.shared.lock();
        let was_pending = st.deadline.take().is_some();
        if thread::current().id() == self.thread_id {
            return was_pending;
        }
        while st.running {
            st = self
                .shared
                .cond
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }
        was_pending
    }

    /// Wait until nothing is pending or running.
    pub fn flush(&self) {
        if thread::current().id() == self.thread_id {
            return;
        }
        let mut st = self.shared.lock();
        while (st.deadline.is_some() || st.running) && !st.shutdown {
            st = self
                .shared
                .cond
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().deadline.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }
}

fn run<F: Fn()>(shared: &Shared, work: F) {
    loop {
        let mut st = shared.lock();
        loop {
            if st.shutdown {
                return;
            }
            match st.deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    st = shared
                        .cond
                        .wait_timeout(st, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
                None => {
                    st = shared.cond.wait(st).unwrap_or_else(|e| e.into_inner());
                }
            }
        }
        st.deadline = None;
        st.running = true;
        drop(st);

        work();

        let mut st = shared.lock();
        st.running = false;
        shared.cond.notify_all();
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        {
            let mut st = self.shared.lock();
            st.shutdown = true;
            st.deadline = None;
            self.shared.cond.notify_all();
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
