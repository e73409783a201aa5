//! Bridges between external threads and the runtime: the completion signal
//! a blocked caller parks on, the tracker counting transitively spawned
//! tasks, and the slot their results travel through.

use parking_lot::{Condvar, Mutex};
use pin_project::pin_project;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::thread;

/// One-shot signal from the last finishing task to the blocked caller.
/// Waiters spin briefly before parking; there is exactly one signaller.
#[derive(Debug, Default)]
pub(crate) struct CompletionSignal {
    ready: AtomicBool,
    lock: Mutex<()>,
    condvar: Condvar,
}

const SPIN_LIMIT: u32 = 32;

impl CompletionSignal {
    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.ready.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.ready.load(Ordering::Acquire) {
                return;
            }
            std::hint::spin_loop();
        }

        let mut guard = self.lock.lock();
        while !self.ready.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
    }
}

/// Counts the root task of a `block_on`/`wait_all` plus every task
/// transitively spawned under it. The caller blocks until the count
/// reaches zero.
#[derive(Debug)]
pub(crate) struct BlockOnTracker {
    pending: AtomicUsize,
    signal: CompletionSignal,
}

impl BlockOnTracker {
    pub(crate) fn new(pending: usize) -> Self {
        Self {
            pending: AtomicUsize::new(pending),
            signal: CompletionSignal::default(),
        }
    }

    /// A task reachable from the tracked root was spawned.
    pub(crate) fn register_task(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// A tracked task finished; the last one releases the caller.
    pub(crate) fn complete_task(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.signal.notify();
        }
    }

    pub(crate) fn wait_all_done(&self) {
        self.signal.wait();
    }
}

/// Result or captured panic of one tracked task, written on a worker and
/// read by the blocked caller after the tracker drains.
#[derive(Debug)]
pub(crate) struct ResultSlot<T> {
    value: Mutex<Option<thread::Result<T>>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, value: thread::Result<T>) {
        *self.value.lock() = Some(value);
    }

    /// Takes the stored result, re-raising a captured panic on the calling
    /// thread.
    pub(crate) fn take(&self) -> T {
        match self.value.lock().take() {
            Some(Ok(value)) => value,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => unreachable!("result slot read before task completion"),
        }
    }
}

/// Polls the wrapped future inside `catch_unwind` so a panicking root task
/// surfaces on the blocking thread instead of taking the worker down.
#[pin_project]
pub(crate) struct CatchUnwind<F> {
    #[pin]
    inner: F,
}

impl<F> CatchUnwind<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = thread::Result<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match panic::catch_unwind(AssertUnwindSafe(|| this.inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_signal_across_threads() {
        let signal = Arc::new(CompletionSignal::default());
        let other = signal.clone();

        let handle = thread::spawn(move || {
            other.wait();
        });

        thread::sleep(std::time::Duration::from_millis(5));
        signal.notify();
        handle.join().unwrap();
    }

    #[test]
    fn test_tracker_signals_at_zero() {
        let tracker = BlockOnTracker::new(1);
        tracker.register_task();

        tracker.complete_task();
        tracker.complete_task();
        // Both tasks done: wait returns immediately.
        tracker.wait_all_done();
    }

    #[test]
    fn test_result_slot_rethrows_panic() {
        let slot = ResultSlot::<i32>::new();
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        slot.set(Err(payload));

        let caught = panic::catch_unwind(AssertUnwindSafe(|| slot.take()));
        assert!(caught.is_err());
    }
}
