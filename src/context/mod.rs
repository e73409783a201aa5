//! Thread-local worker state.
//!
//! Each worker thread initializes its context once at startup: the shared
//! scheduler handle, the producer side of its local queue, the single-slot
//! task cache and the I/O engine. Task polls reach all of it through the
//! accessors here; non-worker threads have no context and take the global
//! queue paths instead.

use crate::io::engine::IoEngine;
use crate::runtime::blocking::BlockOnTracker;
use crate::runtime::queue::Local;
use crate::runtime::shared::Shared;
use crate::task::Task;
use anyhow::{Result, anyhow};
use std::cell::{OnceCell, RefCell};
use std::sync::Arc;

pub(crate) struct WorkerContext {
    pub(crate) shared: Arc<Shared>,

    local: RefCell<Local<Task>>,

    /// Most recently self-scheduled task; popped before the queue proper
    /// so "task schedules its successor" stays on a warm cache line.
    cache: RefCell<Option<Task>>,

    engine: RefCell<IoEngine>,
}

thread_local! {
    static CONTEXT: OnceCell<WorkerContext> = const { OnceCell::new() };

    /// Tracker of the task currently being polled on this thread, if any.
    static TRACKER: RefCell<Option<Arc<BlockOnTracker>>> = const { RefCell::new(None) };
}

pub(crate) fn init_worker(shared: Arc<Shared>, local: Local<Task>, engine: IoEngine) -> Result<()> {
    CONTEXT.with(|ctx| {
        let mut fresh = false;
        ctx.get_or_init(|| {
            fresh = true;
            WorkerContext {
                shared,
                local: RefCell::new(local),
                cache: RefCell::new(None),
                engine: RefCell::new(engine),
            }
        });
        if fresh {
            Ok(())
        } else {
            Err(anyhow!("worker context already initialized on this thread"))
        }
    })
}

pub(crate) fn is_worker_thread() -> bool {
    CONTEXT.with(|ctx| ctx.get().is_some())
}

#[track_caller]
pub(crate) fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&WorkerContext) -> R,
{
    CONTEXT.with(|ctx| {
        let ctx = ctx
            .get()
            .expect("not on a runtime worker thread; submit through the runtime handle");
        f(ctx)
    })
}

#[track_caller]
pub(crate) fn with_engine_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut IoEngine) -> R,
{
    with_context(|ctx| f(&mut ctx.engine.borrow_mut()))
}

pub(crate) fn current_tracker() -> Option<Arc<BlockOnTracker>> {
    TRACKER.with(|t| t.borrow().clone())
}

/// Installs `tracker` as the current poll scope; restores the previous one
/// on drop.
pub(crate) fn enter_tracker(tracker: Option<Arc<BlockOnTracker>>) -> TrackerScope {
    let prev = TRACKER.with(|t| t.replace(tracker));
    TrackerScope { prev }
}

pub(crate) struct TrackerScope {
    prev: Option<Arc<BlockOnTracker>>,
}

impl Drop for TrackerScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        TRACKER.with(|t| *t.borrow_mut() = prev);
    }
}

impl WorkerContext {
    /// Schedules a task on this worker. The cache slot takes the newest
    /// task; evicting the previous occupant into the queue proper means
    /// another worker may have something to steal, so one sleeper is woken.
    pub(crate) fn push_task(&self, task: Task) {
        let mut cache = self.cache.borrow_mut();
        match cache.replace(task) {
            None => {}
            Some(prev) => {
                self.local
                    .borrow_mut()
                    .push_or_overflow(prev, &self.shared.global);
                self.shared.wake_up_one();
            }
        }
    }

    /// Next locally runnable task: the cache slot first, then the queue
    /// tail.
    pub(crate) fn pop_task(&self) -> Option<Task> {
        if let Some(task) = self.cache.borrow_mut().take() {
            return Some(task);
        }
        self.local.borrow_mut().pop()
    }

    pub(crate) fn has_local_work(&self) -> bool {
        self.cache.borrow().is_some() || !self.local.borrow().is_empty()
    }

    pub(crate) fn with_local_mut<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Local<Task>) -> R,
    {
        f(&mut self.local.borrow_mut())
    }
}
