//! The spawned task: one heap allocation holding a type-erased future, a
//! state word, and the bookkeeping to reach the scheduler from any thread.
//!
//! The state machine enforces the ownership rule: at any instant a task is
//! referenced by at most one ready-queue slot or one wait list. A wake
//! while the task is running is deferred and turns into a reschedule when
//! the poll returns.

use crate::context;
use crate::runtime::blocking::BlockOnTracker;
use crate::runtime::shared::Shared;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};

/// Suspended at an event source; only a wake may transition it out.
const IDLE: u8 = 0;
/// Sitting in a ready queue (or the per-worker cache slot).
const SCHEDULED: u8 = 1;
/// Being polled right now.
const RUNNING: u8 = 2;
/// Woken mid-poll; the runner re-enqueues it instead of suspending.
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

#[derive(Clone)]
pub(crate) struct Task {
    cell: Arc<TaskCell>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.cell.state.load(Ordering::Relaxed))
            .finish()
    }
}

pub(crate) struct TaskCell {
    state: AtomicU8,
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,

    /// Route back to the scheduler for wakes from non-worker threads.
    shared: Arc<Shared>,

    /// Set when this task is reachable from a `block_on`/`wait_all` root;
    /// completing decrements the tracked count exactly once.
    tracker: Option<Arc<BlockOnTracker>>,
}

impl Task {
    /// New tasks start out `SCHEDULED`: the spawner pushes them into a
    /// ready queue immediately.
    pub(crate) fn new<F>(
        future: F,
        shared: Arc<Shared>,
        tracker: Option<Arc<BlockOnTracker>>,
    ) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            cell: Arc::new(TaskCell {
                state: AtomicU8::new(SCHEDULED),
                future: Mutex::new(Some(Box::pin(future))),
                shared,
                tracker,
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.cell.shared
    }

    /// Polls the task once. Runs on a worker thread with no queue holding
    /// the task anymore.
    pub(crate) fn run(self) {
        let cell = &self.cell;

        if cell
            .state
            .compare_exchange(SCHEDULED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!("task resumed while not scheduled");
            std::process::abort();
        }

        // Spawns performed during this poll inherit the tracker, which is
        // what makes block_on wait for transitive children.
        let _tracker_scope = context::enter_tracker(cell.tracker.clone());

        let waker = Waker::from(cell.clone());
        let mut cx = Context::from_waker(&waker);

        let poll = {
            let mut slot = cell.future.lock();
            let Some(future) = slot.as_mut() else {
                // Completed on a previous poll; a stale wake slipped
                // through. Nothing to do.
                return;
            };
            let poll = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
            if matches!(poll, Ok(Poll::Ready(()))) {
                *slot = None;
            }
            poll
        };

        match poll {
            Ok(Poll::Ready(())) => {
                cell.state.store(COMPLETE, Ordering::Release);
                if let Some(tracker) = &cell.tracker {
                    tracker.complete_task();
                }
            }
            Ok(Poll::Pending) => {
                // Back to IDLE unless a wake raced in while we were
                // polling, in which case the task goes straight back to a
                // queue.
                if cell
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    debug_assert_eq!(cell.state.load(Ordering::Acquire), NOTIFIED);
                    cell.state.store(SCHEDULED, Ordering::Release);
                    schedule(self.clone());
                }
            }
            Err(payload) => {
                // A detached task owns its own error handling; a panic that
                // escapes one is unrecoverable by design. Roots submitted
                // through block_on/wait_all never reach here: their shim
                // catches first.
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(panic = %msg, "panic escaped a spawned task");
                std::process::abort();
            }
        }
    }
}

impl Wake for TaskCell {
    fn wake(self: Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let next = match state {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                // Already queued, already flagged, or finished.
                SCHEDULED | NOTIFIED | COMPLETE => return,
                _ => unreachable!(),
            };

            match self.state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == SCHEDULED {
                        schedule(Task { cell: self });
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }
}

/// Routes a runnable task to the scheduler: onto the current worker's
/// local queue when on a worker thread, otherwise through the global
/// queue with a wake-up.
pub(crate) fn schedule(task: Task) {
    if context::is_worker_thread() {
        context::with_context(|ctx| ctx.push_task(task));
    } else {
        let shared = task.shared().clone();
        shared.inject(task);
    }
}
