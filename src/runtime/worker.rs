//! The worker loop.
//!
//! One tick: periodically drive I/O and refresh shutdown, pick the next
//! task (local tail, global batch pull, or a steal from the busiest
//! sibling), run it; with nothing runnable, drive I/O once more and then
//! park in the kernel until a completion, a timer deadline, or a
//! cross-thread wake.

use crate::context;
use crate::runtime::queue::MAX_BATCH;
use crate::runtime::shared::Shared;
use crate::runtime::ticker::{Ticker, TickerEvents};
use crate::task::Task;
use crate::utils::ScopeGuard;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub(crate) struct Worker {
    id: usize,
    shared: Arc<Shared>,
    ticker: Ticker,
    is_searching: bool,
    is_shutdown: bool,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> Self {
        let ticker = Ticker::new(
            shared.config.io_interval,
            shared.config.global_queue_interval,
        );
        Self {
            id,
            shared,
            ticker,
            is_searching: false,
            is_shutdown: false,
        }
    }

    pub(crate) fn run(&mut self) {
        tracing::debug!(worker = self.id, "worker started");
        let id = self.id;
        // Logs on every exit path, panics included.
        let _stopped = ScopeGuard::new(move || tracing::debug!(worker = id, "worker stopped"));

        loop {
            let events = self.ticker.tick();

            if events.contains(TickerEvents::DRIVE_IO) {
                self.drive_io();
                self.refresh_shutdown();
            }
            if self.is_shutdown {
                break;
            }

            if let Some(task) = self.next_task(events.contains(TickerEvents::POLL_GLOBAL)) {
                self.execute(task);
                continue;
            }

            if let Some(task) = self.steal_task() {
                self.execute(task);
                continue;
            }

            // Completions may have piled up while we scanned the queues.
            if self.drive_io() {
                continue;
            }

            self.sleep();
            if self.is_shutdown {
                break;
            }
        }
    }

    fn execute(&mut self, task: Task) {
        self.cancel_searching();
        task.run();
    }

    /// Local-first task pickup; every `global_queue_interval` ticks the
    /// priority inverts so global submitters cannot starve. When the local
    /// queue runs dry, a capped batch is pulled over from the global queue.
    fn next_task(&mut self, poll_global: bool) -> Option<Task> {
        let shared = self.shared.clone();
        context::with_context(|ctx| {
            if poll_global {
                return shared.global.try_pop().or_else(|| ctx.pop_task());
            }

            if let Some(task) = ctx.pop_task() {
                return Some(task);
            }
            if shared.global.is_empty() {
                return None;
            }

            let room = ctx.with_local_mut(|local| local.remaining_slots().min(MAX_BATCH));
            if room == 0 {
                return None;
            }

            let mut batch = shared.global.try_pop_batch(room);
            let task = batch.pop();
            if !batch.is_empty() {
                ctx.with_local_mut(|local| local.push_batch(batch.into_iter()));
            }
            task
        })
    }

    /// One bounded steal attempt, gated by the searching cap: pick the
    /// victim with the largest queue among workers that are not themselves
    /// searching (ties to the lowest id), else fall back to the global
    /// queue.
    fn steal_task(&mut self) -> Option<Task> {
        if !self.set_searching() {
            return None;
        }

        let mut victim: Option<(usize, usize)> = None;
        for handle in &self.shared.workers {
            if handle.id == self.id || handle.is_searching.load(Ordering::Acquire) {
                continue;
            }
            let size = handle.steal.len();
            if size > victim.map_or(0, |(_, s)| s) {
                victim = Some((handle.id, size));
            }
        }

        if let Some((victim_id, _)) = victim {
            let steal = &self.shared.workers[victim_id].steal;
            let stolen =
                context::with_context(|ctx| ctx.with_local_mut(|local| steal.steal_into(local)));
            if stolen.is_some() {
                return stolen;
            }
        }

        self.shared.global.try_pop()
    }

    fn drive_io(&mut self) -> bool {
        let produced = context::with_engine_mut(|engine| engine.drive());
        if produced && self.should_notify() {
            self.shared.wake_up_one();
        }
        produced
    }

    /// After producing work: another worker is worth waking only when more
    /// than one task is queued here (one is about to run locally) and this
    /// worker is not already part of a search round.
    fn should_notify(&self) -> bool {
        !self.is_searching && self.shared.workers[self.id].steal.len() > 1
    }

    fn refresh_shutdown(&mut self) {
        if !self.is_shutdown {
            self.is_shutdown = self.shared.global.is_closed();
        }
    }

    fn sleep(&mut self) {
        self.refresh_shutdown();
        if self.is_shutdown || !self.set_sleeping() {
            return;
        }

        loop {
            if self.is_shutdown {
                break;
            }

            context::with_engine_mut(|engine| {
                let timeout = engine.next_deadline_ms();
                engine.wait(timeout);
                engine.drive();
            });

            self.refresh_shutdown();
            if self.cancel_sleeping() {
                break;
            }
        }
    }

    /// Parks this worker in the sleeper set, unless local work surfaced in
    /// the meantime. A last-searcher going to sleep re-checks the queues,
    /// closing the race with a concurrent submit.
    fn set_sleeping(&mut self) -> bool {
        if context::with_context(|ctx| ctx.has_local_work()) {
            return false;
        }

        let was_last_searcher = self.shared.state.set_sleeping(self.id, self.is_searching);
        self.set_searching_flag(false);

        if was_last_searcher {
            self.shared.wake_up_if_work_pending();
        }
        true
    }

    /// Decides whether a kernel wake-up ends the nap: yes when work is
    /// visible or a producer already claimed this worker through the state
    /// machine; otherwise stay parked.
    fn cancel_sleeping(&mut self) -> bool {
        let has_work = context::with_context(|ctx| ctx.has_local_work());
        if has_work || !self.shared.global.is_empty() {
            let removed_self = self.shared.state.cancel_sleeping(self.id);
            // Not found in the sleeper set means a producer claimed us via
            // worker_to_notify and pre-accounted us as searching.
            self.set_searching_flag(!removed_self);
            return true;
        }

        if self.shared.state.contains(self.id) {
            return false;
        }
        self.set_searching_flag(true);
        true
    }

    fn set_searching(&mut self) -> bool {
        if !self.is_searching && self.shared.state.set_searching() {
            self.set_searching_flag(true);
        }
        self.is_searching
    }

    fn cancel_searching(&mut self) {
        if !self.is_searching {
            return;
        }
        self.set_searching_flag(false);
        if self.shared.state.cancel_searching() {
            // The last searcher is taking a task; keep the system probing.
            self.shared.wake_up_one();
        }
    }

    fn set_searching_flag(&mut self, value: bool) {
        self.is_searching = value;
        self.shared.workers[self.id]
            .is_searching
            .store(value, Ordering::Release);
    }
}
