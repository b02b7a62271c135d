use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Returned when posting to an event that already fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyPosted;

/// Post-once, multiple-waiters event carrying a value.
///
/// A single writer posts exactly once; any number of clones may wait for the value.
/// The mutex/condvar pair is the memory barrier between the posting thread and the waiters.
pub struct OneShot<T> {
    slot: Arc<Mutex<Option<T>>>,
    condvar: Arc<Condvar>,
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
            condvar: self.condvar.clone(),
        }
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn post(&self, val: T) -> Result<(), AlreadyPosted> {
        let mut guard = self.slot.lock();
        if guard.is_some() {
            return Err(AlreadyPosted);
        }
        *guard = Some(val);
        self.condvar.notify_all();
        Ok(())
    }

    pub fn is_posted(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Non-blocking read
    pub fn peek(&self) -> Option<T> {
        self.slot.lock().clone()
    }

    /// Blocks until the event is posted
    pub fn wait(&self) -> T {
        let mut guard = self.slot.lock();
        loop {
            // Check if the value has already been posted. Wait if not yet posted:
            if let Some(val) = &*guard {
                return val.clone();
            }
            self.condvar.wait(&mut guard);
        }
    }

    /// Blocks up to `timeout`; `None` if the event was not posted in time
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.lock();
        loop {
            if let Some(val) = &*guard {
                return Some(val.clone());
            }
            if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                return guard.clone();
            }
        }
    }
}
