//! Execution contexts: the background worker that owns all hardware
//! interaction, and the caller-side contexts that receive burst results.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::Result;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerRequest {
    Run(Task),
    Shutdown,
}

/// One named background thread running jobs strictly in submission order.
pub struct Worker {
    name: String,
    request_tx: Mutex<Sender<WorkerRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread.
    pub fn spawn(name: &str) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_loop(&request_rx))?;
        debug!(worker = name, "worker started");

        Ok(Self {
            name: name.to_owned(),
            request_tx: Mutex::new(request_tx),
            handle: Some(handle),
        })
    }

    /// Queue a job. Returns `false` if the worker has already stopped.
    pub fn submit(&self, task: Task) -> bool {
        self.request_tx.lock().send(WorkerRequest::Run(task)).is_ok()
    }

    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.request_tx.lock().send(WorkerRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Dropped from one of its own jobs; the loop exits on Shutdown.
                return;
            }
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

fn worker_loop(request_rx: &Receiver<WorkerRequest>) {
    for request in request_rx {
        match request {
            WorkerRequest::Run(task) => {
                // A panicking job must not take later jobs down with it.
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    error!(panic = panic_message(payload.as_ref()), "worker job panicked");
                }
            }
            WorkerRequest::Shutdown => break,
        }
    }
    debug!("worker stopped");
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Where a burst delivers its result.
pub trait CallerContext: Send + Sync {
    /// Run `task` on this context.
    fn post(&self, task: Task);
}

/// Runs tasks immediately on whichever thread posts them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl CallerContext for Inline {
    fn post(&self, task: Task) {
        task();
    }
}

/// Task queue pumped by the caller's own loop.
pub struct CallerQueue {
    task_tx: Mutex<Sender<Task>>,
    task_rx: Mutex<Receiver<Task>>,
}

impl Default for CallerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CallerQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let (task_tx, task_rx) = mpsc::channel();
        Self {
            task_tx: Mutex::new(task_tx),
            task_rx: Mutex::new(task_rx),
        }
    }

    /// Run every queued task without blocking. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.task_rx.lock().try_recv();
            match next {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(_) => return ran,
            }
        }
    }

    /// Wait up to `timeout` for one task and run it. Returns whether one ran.
    pub fn run_next(&self, timeout: Duration) -> bool {
        let next = self.task_rx.lock().recv_timeout(timeout);
        match next {
            Ok(task) => {
                task();
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("caller queue disconnected");
                false
            }
        }
    }
}

impl CallerContext for CallerQueue {
    fn post(&self, task: Task) {
        if self.task_tx.lock().send(task).is_err() {
            warn!("caller queue closed; dropping task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_worker_runs_jobs_in_order() {
        let worker = Worker::spawn("test-worker").expect("spawn");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            assert!(worker.submit(Box::new(move || {
                assert_eq!(thread::current().name(), Some("test-worker"));
                seen.lock().push(i);
            })));
        }
        drop(worker);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    #[allow(clippy::panic)]
    fn test_worker_survives_panicking_job() {
        let worker = Worker::spawn("panicky").expect("spawn");
        let count = Arc::new(AtomicUsize::new(0));

        assert!(worker.submit(Box::new(|| panic!("job bug"))));
        let counter = Arc::clone(&count);
        assert!(worker.submit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        drop(worker);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_message_reads_both_payload_kinds() {
        let literal: Box<dyn Any + Send> = Box::new("static text");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned text"));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(literal.as_ref()), "static text");
        assert_eq!(panic_message(owned.as_ref()), "owned text");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_caller_queue_runs_on_pumping_thread() {
        let queue = Arc::new(CallerQueue::new());
        let ran_on = Arc::new(Mutex::new(None));
        let worker = Worker::spawn("poster").expect("spawn");

        let target = Arc::clone(&queue);
        let record = Arc::clone(&ran_on);
        worker.submit(Box::new(move || {
            target.post(Box::new(move || {
                *record.lock() = Some(thread::current().id());
            }));
        }));

        assert!(queue.run_next(Duration::from_secs(2)));
        assert_eq!(*ran_on.lock(), Some(thread::current().id()));
        assert!(!queue.run_next(Duration::from_millis(10)));
    }

    #[test]
    fn test_run_pending_drains_without_blocking() {
        let queue = CallerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = Arc::clone(&count);
            queue.post(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(queue.run_pending(), 3);
        assert_eq!(queue.run_pending(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_inline_runs_immediately() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        Inline.post(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
