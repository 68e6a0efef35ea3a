//! Single-slot wait/notify gates.
//!
//! A gate turns an asynchronous reply into a blocking call. The client arms
//! it before sending a request, the server loop fulfills it when the reply
//! arrives, and the client's [`Gate::wait`] returns the carried result.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{DhtError, Result};

#[derive(Debug)]
enum Slot<T> {
    Idle,
    Armed,
    Filled(T),
}

/// A mutex-protected slot plus a condition variable.
///
/// At most one request may be outstanding per gate: arming an already armed
/// gate is [`DhtError::GateBusy`], fulfilling a gate nobody armed is
/// [`DhtError::UnexpectedReply`].
#[derive(Debug)]
pub struct Gate<T> {
    name: &'static str,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Gate<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(Slot::Idle),
            ready: Condvar::new(),
        }
    }

    /// Marks a request as outstanding. Must precede the matching send so a
    /// fast reply cannot find the gate idle.
    pub fn arm(&self) -> Result<()> {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Idle) {
            return Err(DhtError::GateBusy(self.name));
        }
        *slot = Slot::Armed;
        Ok(())
    }

    /// Withdraws an armed request whose send failed.
    pub fn disarm(&self) {
        *self.lock() = Slot::Idle;
    }

    /// Stores the reply and wakes the waiting client.
    pub fn fulfill(&self, value: T) -> Result<()> {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Armed) {
            return Err(DhtError::UnexpectedReply(self.name));
        }
        *slot = Slot::Filled(value);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks until the gate is fulfilled, then takes the result and leaves
    /// the gate idle.
    ///
    /// There is no timeout: a lost reply blocks forever.
    pub fn wait(&self) -> T {
        let mut slot = self.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Filled(value) => return value,
                pending => {
                    *slot = pending;
                    slot = self
                        .ready
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The gates one node's client and server share.
#[derive(Debug)]
pub struct Gates {
    pub put: Gate<()>,
    pub get: Gate<i64>,
    pub size: Gate<u64>,
}

impl Default for Gates {
    fn default() -> Self {
        Self {
            put: Gate::new("put"),
            get: Gate::new("get"),
            size: Gate::new("size"),
        }
    }
}
