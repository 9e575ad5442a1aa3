//! Exclusive access gate guarding open/close of the camera hardware.
//!
//! At most one permit is outstanding. Permits are ticketed: releasing a permit
//! that is no longer the current holder does nothing, so a late release from
//! an asynchronous device error can never free somebody else's hold.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct GateInner {
    holder: Mutex<Option<u64>>,
    cond: Condvar,
    next_ticket: AtomicU64,
    acquisitions: AtomicU64,
}

/// Binary mutual-exclusion primitive shared by every burst that may touch the device.
#[derive(Clone)]
pub struct AccessGate {
    inner: Arc<GateInner>,
}

impl Default for AccessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GateInner {
                holder: Mutex::new(None),
                cond: Condvar::new(),
                next_ticket: AtomicU64::new(1),
                acquisitions: AtomicU64::new(0),
            }),
        }
    }

    /// Wait up to `timeout` for the gate. `None` means it stayed held.
    pub fn acquire(&self, timeout: Duration) -> Option<GatePermit> {
        let deadline = Instant::now() + timeout;
        let mut holder = self.inner.holder.lock();
        while holder.is_some() {
            if self
                .inner
                .cond
                .wait_until(&mut holder, deadline)
                .timed_out()
                && holder.is_some()
            {
                tracing::debug!(?timeout, "gate acquisition timed out");
                return None;
            }
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        *holder = Some(ticket);
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(ticket, "gate acquired");

        Some(GatePermit {
            gate: self.clone(),
            ticket,
        })
    }

    /// Whether some permit currently holds the gate.
    pub fn is_held(&self) -> bool {
        self.inner.holder.lock().is_some()
    }

    /// Number of successful acquisitions so far.
    pub fn acquisitions(&self) -> u64 {
        self.inner.acquisitions.load(Ordering::Relaxed)
    }

    fn release_ticket(&self, ticket: u64) -> bool {
        let mut holder = self.inner.holder.lock();
        if *holder != Some(ticket) {
            return false;
        }
        *holder = None;
        self.inner.cond.notify_one();
        tracing::trace!(ticket, "gate released");
        true
    }
}

/// Proof of a successful [`AccessGate::acquire`].
///
/// Clones refer to the same hold; the first release wins and later ones are no-ops.
#[derive(Clone)]
pub struct GatePermit {
    gate: AccessGate,
    ticket: u64,
}

impl GatePermit {
    /// Release the hold. Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        self.gate.release_ticket(self.ticket)
    }

    /// Whether this permit still holds the gate.
    pub fn is_held(&self) -> bool {
        *self.gate.inner.holder.lock() == Some(self.ticket)
    }
}

impl std::fmt::Debug for GatePermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePermit")
            .field("ticket", &self.ticket)
            .finish()
    }
}
