//! Single-fire latch bridging an asynchronous callback to a blocking wait.
//!
//! The sender side is handed to a platform listener and fires at most once;
//! the receiver blocks the worker with a timeout. One latch per pending
//! operation, never more than one wait per logical step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a wait ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed before the latch fired.
    TimedOut,
    /// The sender was dropped without firing.
    Abandoned,
}

enum Slot<T> {
    Pending,
    Fired(T),
    Taken,
    Abandoned,
}

struct State<T> {
    slot: Slot<T>,
    waiter_gone: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// Firing half of a latch.
pub struct LatchSender<T> {
    shared: Arc<Shared<T>>,
    fired: bool,
}

/// Waiting half of a latch.
pub struct Latch<T> {
    shared: Arc<Shared<T>>,
}

/// Create a connected sender/latch pair.
pub fn latch<T>() -> (LatchSender<T>, Latch<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            slot: Slot::Pending,
            waiter_gone: false,
        }),
        cond: Condvar::new(),
    });
    (
        LatchSender {
            shared: Arc::clone(&shared),
            fired: false,
        },
        Latch { shared },
    )
}

impl<T> LatchSender<T> {
    /// Fire the latch. Hands the value back if the waiter has already given up,
    /// so the caller can dispose of it.
    pub fn fire(mut self, value: T) -> Result<(), T> {
        self.fired = true;
        let mut state = self.shared.state.lock();
        if state.waiter_gone {
            return Err(value);
        }
        state.slot = Slot::Fired(value);
        self.shared.cond.notify_all();
        Ok(())
    }
}

impl<T> Drop for LatchSender<T> {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        let mut state = self.shared.state.lock();
        if matches!(state.slot, Slot::Pending) {
            state.slot = Slot::Abandoned;
            self.shared.cond.notify_all();
        }
    }
}

impl<T> Latch<T> {
    /// Block until the latch fires or the sender is dropped.
    pub fn wait(&self) -> Result<T, WaitError> {
        let mut state = self.shared.state.lock();
        while matches!(state.slot, Slot::Pending) {
            self.shared.cond.wait(&mut state);
        }
        Self::take(&mut state.slot)
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, WaitError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(state.slot, Slot::Pending) {
            if self
                .shared
                .cond
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        Self::take(&mut state.slot)
    }

    fn take(slot: &mut Slot<T>) -> Result<T, WaitError> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Fired(value) => Ok(value),
            Slot::Pending => {
                *slot = Slot::Pending;
                Err(WaitError::TimedOut)
            }
            Slot::Abandoned => {
                *slot = Slot::Abandoned;
                Err(WaitError::Abandoned)
            }
            Slot::Taken => Err(WaitError::Abandoned),
        }
    }
}

impl<T> Drop for Latch<T> {
    fn drop(&mut self) {
        self.shared.state.lock().waiter_gone = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fire_from_other_thread() {
        let (tx, rx) = latch();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            assert!(tx.fire(42).is_ok());
        });
        assert_eq!(rx.wait_timeout(Duration::from_secs(2)), Ok(42));
        handle.join().expect("sender thread panicked");
    }

    #[test]
    fn test_timeout_without_fire() {
        let (tx, rx) = latch::<u32>();
        let start = Instant::now();
        assert_eq!(
            rx.wait_timeout(Duration::from_millis(30)),
            Err(WaitError::TimedOut)
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
        drop(tx);
    }

    #[test]
    fn test_dropped_sender_abandons() {
        let (tx, rx) = latch::<u32>();
        drop(tx);
        assert_eq!(rx.wait(), Err(WaitError::Abandoned));
    }

    #[test]
    fn test_fire_after_waiter_gone_returns_value() {
        let (tx, rx) = latch();
        assert_eq!(
            rx.wait_timeout(Duration::from_millis(1)),
            Err(WaitError::TimedOut)
        );
        drop(rx);
        assert_eq!(tx.fire("late"), Err("late"));
    }

    #[test]
    fn test_value_is_taken_once() {
        let (tx, rx) = latch();
        assert!(tx.fire(1).is_ok());
        assert_eq!(rx.wait_timeout(Duration::from_millis(1)), Ok(1));
        assert_eq!(
            rx.wait_timeout(Duration::from_millis(1)),
            Err(WaitError::Abandoned)
        );
    }
}
