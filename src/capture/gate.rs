//! "Changes possible" gate guarding the capture session.
//!
//! Between asking the hardware to open a device and the resulting capture
//! session becoming active, nobody may close the device or rebuild requests.
//! Waiters block on a condition variable, bounded by a timeout, and a
//! cancellation wakes every waiter so shutdown never hangs.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

#[derive(Debug)]
struct GateState {
    possible: bool,
    cancelled: bool,
}

#[derive(Debug)]
pub struct ChangesGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Default for ChangesGate {
    fn default() -> Self {
        Self {
            state: Mutex::new(GateState {
                possible: true,
                cancelled: false,
            }),
            changed: Condvar::new(),
        }
    }
}

impl ChangesGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A configuration is now in flight
    pub fn begin_change(&self) {
        self.lock().possible = false;
    }

    /// The in-flight configuration settled, successfully or not
    pub fn finish_change(&self) {
        self.lock().possible = true;
        self.changed.notify_all();
    }

    pub fn changes_possible(&self) -> bool {
        self.lock().possible
    }

    /// Wake all waiters with [`Error::Cancelled`] until [`ChangesGate::reset`]
    pub fn cancel(&self) {
        debug!("Cancelling changes-possible waiters");
        self.lock().cancelled = true;
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn reset(&self) {
        self.lock().cancelled = false;
    }

    /// Block until changes are possible, the gate is cancelled or `timeout` expires
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let guard = self.lock();
        let (state, result) = self
            .changed
            .wait_timeout_while(guard, timeout, |s| !s.possible && !s.cancelled)
            .unwrap_or_else(PoisonError::into_inner);

        if state.possible {
            Ok(())
        } else if state.cancelled {
            Err(Error::Cancelled)
        } else {
            debug_assert!(result.timed_out());
            Err(Error::ConfigurationRace(format!(
                "session configuration still in flight after {:?}",
                timeout
            )))
        }
    }
}
