//! In-flight operation table.
//!
//! Every submitted op gets a slab slot whose key doubles as the SQE
//! user_data, plus a shared [`OpCell`] holding its lifecycle. The cell is
//! shared between the awaiting future and the engine so the result survives
//! task migration: the worker that owns the ring completes the cell, and
//! the task can observe it from whichever worker resumes it.

use crate::io::IoError;
use crate::timer::TimerHandle;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::task::{Poll, Waker};

/// CQE user_data of the armed eventfd read; never dispatched as a user op.
pub(crate) const WAKER_TOKEN: u64 = u64::MAX;

/// CQE user_data of timeout-driven cancel ops; their results are ignored.
pub(crate) const CANCEL_TOKEN: u64 = u64::MAX - 1;

#[derive(Debug)]
enum OpPhase {
    /// Submitted, waiting for the kernel. Holds the waker of the task
    /// suspended on the op.
    Waiting(Option<Waker>),
    /// The kernel posted a completion; `result < 0` is a negated errno.
    Done(i32),
    /// The timing wheel fired first. The kernel completion (cancel or the
    /// original result, whichever wins the race) is ignored when it lands.
    TimedOut,
    /// The awaiting future was dropped; the completion is discarded.
    Abandoned,
}

#[derive(Debug)]
pub(crate) struct OpCell {
    phase: Mutex<OpPhase>,
}

impl OpCell {
    pub(crate) fn new(waker: Waker) -> Arc<Self> {
        Arc::new(Self {
            phase: Mutex::new(OpPhase::Waiting(Some(waker))),
        })
    }

    /// Records the kernel result. The first writer wins; later completions
    /// for the same op (e.g. after a timeout) are no-ops.
    pub(crate) fn complete(&self, result: i32) {
        let waker = {
            let mut phase = self.phase.lock();
            match &mut *phase {
                OpPhase::Waiting(waker) => {
                    let waker = waker.take();
                    *phase = OpPhase::Done(result);
                    waker
                }
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Marks the op timed out. Returns false when a completion already won
    /// the race, in which case no cancel needs to be submitted.
    pub(crate) fn mark_timed_out(&self) -> bool {
        let waker = {
            let mut phase = self.phase.lock();
            match &mut *phase {
                OpPhase::Waiting(waker) => {
                    let waker = waker.take();
                    *phase = OpPhase::TimedOut;
                    waker
                }
                _ => return false,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    /// The awaiting future went away before the completion.
    pub(crate) fn abandon(&self) {
        let mut phase = self.phase.lock();
        if matches!(*phase, OpPhase::Waiting(_)) {
            *phase = OpPhase::Abandoned;
        }
    }

    pub(crate) fn poll_result(&self, waker: &Waker) -> Poll<Result<i32, IoError>> {
        let mut phase = self.phase.lock();
        match &mut *phase {
            OpPhase::Waiting(slot) => {
                *slot = Some(waker.clone());
                Poll::Pending
            }
            OpPhase::Done(result) if *result < 0 => Poll::Ready(Err(IoError::from_raw(*result))),
            OpPhase::Done(result) => Poll::Ready(Ok(*result)),
            OpPhase::TimedOut => Poll::Ready(Err(IoError::TimedOut)),
            OpPhase::Abandoned => unreachable!("abandoned op polled"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct OpEntry {
    pub(crate) cell: Arc<OpCell>,
    /// Back-pointer to the deadline guarding this op, removed when the
    /// completion arrives first.
    pub(crate) timer: Option<TimerHandle>,
}

/// Ops currently owned by the kernel, keyed by SQE user_data.
#[derive(Debug)]
pub(crate) struct OpSlab {
    ops: Slab<OpEntry>,
}

impl OpSlab {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, cell: Arc<OpCell>) -> usize {
        self.ops.insert(OpEntry { cell, timer: None })
    }

    pub(crate) fn get_mut(&mut self, key: usize) -> Option<&mut OpEntry> {
        self.ops.get_mut(key)
    }

    pub(crate) fn remove(&mut self, key: usize) -> Option<OpEntry> {
        self.ops.try_remove(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Waker, Arc<CountingWake>) {
        let inner = Arc::new(CountingWake(AtomicUsize::new(0)));
        (Waker::from(inner.clone()), inner)
    }

    #[test]
    fn test_complete_wakes_once() {
        let (waker, count) = counting_waker();
        let cell = OpCell::new(waker.clone());

        cell.complete(7);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        // A second completion (timeout race) is idempotent.
        cell.complete(-libc::ECANCELED);
        assert_eq!(count.0.load(Ordering::SeqCst), 1);

        assert!(matches!(cell.poll_result(&waker), Poll::Ready(Ok(7))));
    }

    #[test]
    fn test_timeout_then_completion_is_ignored() {
        let (waker, _) = counting_waker();
        let cell = OpCell::new(waker.clone());

        assert!(cell.mark_timed_out());
        // The raced kernel completion changes nothing.
        cell.complete(123);

        assert!(matches!(
            cell.poll_result(&waker),
            Poll::Ready(Err(IoError::TimedOut))
        ));
        // A timeout after the fact reports that no cancel is needed.
        assert!(!cell.mark_timed_out());
    }

    #[test]
    fn test_negative_result_decodes_errno() {
        let (waker, _) = counting_waker();
        let cell = OpCell::new(waker.clone());
        cell.complete(-libc::EBADF);

        match cell.poll_result(&waker) {
            Poll::Ready(Err(IoError::Os(err))) => {
                assert_eq!(err.raw_os_error(), Some(libc::EBADF));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
