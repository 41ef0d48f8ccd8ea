//! Named diagnostic gates. Tests enable a gate to force a code path or to
//! hold a worker at a known point; production leaves them all off.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct FailPoint {
    name: &'static str,
    enabled: AtomicBool,
    lock: Mutex<()>,
    released: Condvar,
}

impl FailPoint {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn should_fail(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        let _guard = self.lock.lock();
        self.enabled.store(false, Ordering::Release);
        self.released.notify_all();
    }

    /// Block the calling thread until the gate is disabled. Returns
    /// immediately when the gate is off.
    pub fn pause_while_set(&self) {
        let mut guard = self.lock.lock();
        while self.enabled.load(Ordering::Acquire) {
            self.released.wait(&mut guard);
        }
    }
}

/// Holds workers between recording an op's apply start time and the actual
/// apply, so tests can observe in-flight state.
pub static HANG_AFTER_RECORDING_OP_APPLICATION_START_TIME: FailPoint =
    FailPoint::new("hang_after_recording_op_application_start_time");

pub fn fail_point(name: &str) -> Option<&'static FailPoint> {
    [&HANG_AFTER_RECORDING_OP_APPLICATION_START_TIME]
        .into_iter()
        .find(|fp| fp.name() == name)
}
