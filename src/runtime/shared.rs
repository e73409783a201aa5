//! State shared by every worker and by external submitters: the global
//! queue, the scheduler state machine and the per-worker handles used for
//! stealing and cross-thread wake-ups.

use crate::io::waker::EventWaker;
use crate::runtime::RuntimeConfig;
use crate::runtime::queue::{GlobalQueue, Overflow, Steal};
use crate::runtime::state::StateMachine;
use crate::task::Task;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// The part of a worker other threads may touch.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    pub(crate) id: usize,

    /// Consumer side of the worker's local queue.
    pub(crate) steal: Steal<Task>,

    /// Pops the worker out of its kernel wait.
    pub(crate) waker: Arc<EventWaker>,

    /// Published by the worker; stealers skip victims that are themselves
    /// searching.
    pub(crate) is_searching: AtomicBool,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,
    pub(crate) state: StateMachine,
    pub(crate) global: GlobalQueue<Task>,
    pub(crate) workers: Vec<WorkerHandle>,
}

impl Shared {
    pub(crate) fn new(config: RuntimeConfig, workers: Vec<WorkerHandle>) -> Self {
        let state = StateMachine::new(config.num_workers);
        Self {
            config,
            state,
            global: GlobalQueue::new(),
            workers,
        }
    }

    /// Submits one task from outside the workers. Returns false when the
    /// runtime is shutting down and the task was not accepted.
    pub(crate) fn inject(&self, task: Task) -> bool {
        if self.global.push(task).is_err() {
            return false;
        }
        self.wake_up_one();
        // When every worker is accounted busy the state machine issues no
        // wake, but one of them may be racing into sleep right now. The
        // eventfd broadcast is cheap and each sleeper re-checks the global
        // queue before parking again.
        self.wake_up_all();
        true
    }

    /// Submits a batch; used by `wait_all`.
    pub(crate) fn inject_batch(&self, tasks: impl Iterator<Item = Task>) {
        self.global.push_batch(tasks);
        self.wake_up_one();
        self.wake_up_all();
    }

    pub(crate) fn wake_up_one(&self) {
        if let Some(id) = self.state.worker_to_notify() {
            self.workers[id].waker.wake();
        }
    }

    pub(crate) fn wake_up_all(&self) {
        for worker in &self.workers {
            worker.waker.wake();
        }
    }

    /// The last searcher is going to sleep: if anything runnable is still
    /// visible, wake one worker so it cannot strand.
    pub(crate) fn wake_up_if_work_pending(&self) {
        if !self.global.is_empty() {
            self.wake_up_one();
            return;
        }
        for worker in &self.workers {
            if !worker.steal.is_empty() {
                self.wake_up_one();
                return;
            }
        }
    }

    /// Sticky shutdown: closes the global queue and kicks every sleeper so
    /// workers observe the flag.
    pub(crate) fn close(&self) {
        if !self.global.is_closed() {
            self.global.close();
            self.wake_up_all();
        }
    }
}
