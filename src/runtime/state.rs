//! Worker state accounting: how many workers are working or searching, and
//! which ones are asleep.
//!
//! The "at most half searching" cap bounds steal storms; the "last
//! searcher" handshake closes the race where a producer enqueues work just
//! as every searcher decides to sleep.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters for working and searching workers. Kept separate from the
/// sleeper list so the hot paths stay lock-free.
#[derive(Debug)]
struct WorkerCounters {
    working: AtomicUsize,
    searching: AtomicUsize,
}

impl WorkerCounters {
    fn new(num_workers: usize) -> Self {
        Self {
            working: AtomicUsize::new(num_workers),
            searching: AtomicUsize::new(0),
        }
    }

    fn num_working(&self) -> usize {
        self.working.load(Ordering::SeqCst)
    }

    fn num_searching(&self) -> usize {
        self.searching.load(Ordering::SeqCst)
    }

    fn inc_searching(&self) {
        self.searching.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when the caller was the last searcher.
    fn dec_searching(&self) -> bool {
        let prev = self.searching.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "searching counter underflow");
        prev == 1
    }

    /// A sleeping worker is being woken: working + 1, and it starts out
    /// searching so it will scan the queues before sleeping again.
    fn wake_one(&self) {
        self.working.fetch_add(1, Ordering::SeqCst);
        self.searching.fetch_add(1, Ordering::SeqCst);
    }

    /// A worker is going to sleep. Returns true when it was the last
    /// searcher.
    fn dec_working(&self, was_searching: bool) -> bool {
        self.working.fetch_sub(1, Ordering::SeqCst);
        if was_searching {
            return self.dec_searching();
        }
        false
    }
}

/// Coordinates worker wake-ups and enforces the searching cap.
#[derive(Debug)]
pub(crate) struct StateMachine {
    counters: WorkerCounters,
    num_workers: usize,
    sleepers: Mutex<Vec<usize>>,
}

impl StateMachine {
    pub(crate) fn new(num_workers: usize) -> Self {
        Self {
            counters: WorkerCounters::new(num_workers),
            num_workers,
            sleepers: Mutex::new(Vec::with_capacity(num_workers)),
        }
    }

    /// Picks a sleeping worker to wake, if one is needed: only when nobody
    /// is searching and some worker is idle. Double-checked so the common
    /// "everyone is busy" case never takes the lock. On success the chosen
    /// worker is accounted as working and searching before its eventfd is
    /// even written.
    pub(crate) fn worker_to_notify(&self) -> Option<usize> {
        if !self.should_wake() {
            return None;
        }

        let mut sleepers = self.sleepers.lock();

        if !self.should_wake() {
            return None;
        }

        let worker_id = sleepers.pop()?;
        self.counters.wake_one();
        Some(worker_id)
    }

    /// Moves a worker into the sleeper set. Returns true when it was the
    /// last searcher, in which case the caller must re-check the queues and
    /// wake someone if work is pending.
    pub(crate) fn set_sleeping(&self, worker_id: usize, was_searching: bool) -> bool {
        let mut sleepers = self.sleepers.lock();
        let is_last = self.counters.dec_working(was_searching);
        sleepers.push(worker_id);
        is_last
    }

    /// Tries to enter the searching state. Denied when half the workers are
    /// already searching; the caller then skips stealing this round.
    pub(crate) fn set_searching(&self) -> bool {
        if 2 * (self.counters.num_searching() + 1) > self.num_workers {
            return false;
        }
        self.counters.inc_searching();
        true
    }

    /// Leaves the searching state. Returns true when the caller was the
    /// last searcher.
    pub(crate) fn cancel_searching(&self) -> bool {
        self.counters.dec_searching()
    }

    /// Removes a worker from the sleeper set. Returns true when the worker
    /// was still in the set; false means a producer already claimed it via
    /// [`worker_to_notify`] and accounted it as working.
    ///
    /// [`worker_to_notify`]: StateMachine::worker_to_notify
    pub(crate) fn cancel_sleeping(&self, worker_id: usize) -> bool {
        let mut sleepers = self.sleepers.lock();
        if let Some(pos) = sleepers.iter().position(|&id| id == worker_id) {
            sleepers.swap_remove(pos);
            self.counters.working.fetch_add(1, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub(crate) fn contains(&self, worker_id: usize) -> bool {
        self.sleepers.lock().iter().any(|&id| id == worker_id)
    }

    fn should_wake(&self) -> bool {
        self.counters.num_searching() == 0 && self.counters.num_working() < self.num_workers
    }

    #[cfg(test)]
    fn num_searching(&self) -> usize {
        self.counters.num_searching()
    }

    #[cfg(test)]
    fn num_working(&self) -> usize {
        self.counters.num_working()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_no_wake_while_all_working() {
        let state = StateMachine::new(2);
        // Everyone starts working, nobody sleeps.
        assert_eq!(state.worker_to_notify(), None);
    }

    #[test]
    fn test_wake_pops_a_sleeper() {
        let state = StateMachine::new(2);
        assert!(!state.set_sleeping(0, false));
        assert_eq!(state.num_working(), 1);

        let woken = state.worker_to_notify();
        assert_eq!(woken, Some(0));
        // The woken worker is pre-accounted as working and searching.
        assert_eq!(state.num_working(), 2);
        assert_eq!(state.num_searching(), 1);

        // With a searcher active no further wake is issued.
        assert!(!state.set_sleeping(1, false));
        assert_eq!(state.worker_to_notify(), None);
    }

    #[test]
    fn test_last_searcher_handshake() {
        let state = StateMachine::new(4);
        assert!(state.set_searching());
        assert!(state.set_searching());

        assert!(!state.cancel_searching());
        assert!(state.cancel_searching());
    }

    #[rstest]
    #[case::one_worker(1, 0)]
    #[case::two_workers(2, 1)]
    #[case::four_workers(4, 2)]
    #[case::five_workers(5, 2)]
    fn test_searching_cap(#[case] workers: usize, #[case] max_searching: usize) {
        let state = StateMachine::new(workers);
        let mut granted = 0;
        while state.set_searching() {
            granted += 1;
        }
        assert_eq!(granted, max_searching);
    }

    #[test]
    fn test_set_sleeping_reports_last_searcher() {
        let state = StateMachine::new(2);
        assert!(state.set_searching());
        assert!(state.set_sleeping(0, true));
        assert!(state.contains(0));
    }

    #[test]
    fn test_cancel_sleeping() {
        let state = StateMachine::new(2);
        let _ = state.set_sleeping(0, false);

        assert!(state.cancel_sleeping(0));
        assert!(!state.contains(0));
        assert_eq!(state.num_working(), 2);

        // Already removed: a second cancel is a no-op.
        assert!(!state.cancel_sleeping(0));
    }

    #[test]
    fn test_notify_then_cancel_sleeping_misses() {
        let state = StateMachine::new(2);
        let _ = state.set_sleeping(1, false);

        assert_eq!(state.worker_to_notify(), Some(1));
        // The producer claimed the worker; its own cancel finds nothing.
        assert!(!state.cancel_sleeping(1));
    }
}
