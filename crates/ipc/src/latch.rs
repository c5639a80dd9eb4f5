//! Set-once value cell used to turn asynchronous completions into
//! synchronous waits.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::lock;

/// Holds at most one value. Producers call [`ValueLatch::set`] exactly once;
/// consumers block in [`ValueLatch::get`] or bail out after a deadline with
/// [`ValueLatch::get_timeout`].
#[derive(Debug)]
pub struct ValueLatch<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Default for ValueLatch<T> {
    fn default() -> Self {
        ValueLatch {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }
}

impl<T> ValueLatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the value and wakes every waiter. A second set is a producer
    /// bug; the late value is dropped.
    pub fn set(&self, value: T) {
        let mut slot = lock(&self.slot);
        if slot.is_some() {
            warn!("value latch set more than once, dropping the late value");
            return;
        }
        *slot = Some(value);
        self.cond.notify_all();
    }

    /// Blocks until a value arrives and takes it.
    pub fn get(&self) -> T {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(value) = slot.take() {
                return value;
            }
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Blocks until a value arrives or the deadline passes.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = lock(&self.slot);
        let (mut slot, _result) = self
            .cond
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.take()
    }
}
