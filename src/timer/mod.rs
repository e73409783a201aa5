//! Per-worker hierarchical timer.
//!
//! Each worker owns one [`Timer`]. Level 0 covers 64 ms at 1 ms per slot;
//! every level above multiplies the slot width by 64. The root wheel grows
//! and shrinks with demand: inserting an interval beyond the current span
//! wraps the root as slot 0 of a new parent, and draining the upper slots
//! unwraps it again.
//!
//! Entries either wake a sleeping task or time out an in-flight I/O
//! operation. Firing is never early: slots are placed relative to the
//! wheel's start basis, which only advances when the wheel is polled.

use smallvec::SmallVec;
use std::task::Waker;
use std::time::{Duration, Instant};

mod wheel;
use wheel::Wheel;

pub(crate) const SLOT_COUNT: u64 = 64;
pub(crate) const SLOT_SHIFT: u32 = 6;
pub(crate) const MAX_LEVEL: u8 = 6;

/// What to do when an entry fires.
#[derive(Debug)]
pub(crate) enum TimerKind {
    /// A sleeping task; waking it re-enqueues it on this worker.
    Wake(Waker),
    /// An in-flight op, identified by its slab key. Firing marks the op
    /// timed out and submits a kernel-level cancel.
    IoTimeout(usize),
}

#[derive(Debug)]
pub(crate) struct TimerEntry {
    id: u64,
    pub(crate) kind: TimerKind,
}

/// Identifies a registered entry so it can be removed before it fires,
/// e.g. when the guarded I/O completes first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerHandle {
    id: u64,
    deadline: Instant,
}

/// The requested deadline does not fit even the largest wheel
/// configuration (64^7 ms, roughly 140 years).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timer deadline exceeds the maximum wheel span")]
pub(crate) struct DeadlineTooFar;

#[derive(Debug)]
pub(crate) struct Timer {
    /// Basis instant for all slot arithmetic; advances on poll.
    start: Instant,
    entries: usize,
    next_id: u64,
    root: Option<Wheel>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            entries: 0,
            next_id: 0,
            root: None,
        }
    }

    /// Registers an entry to fire at `deadline`. The root wheel is promoted
    /// until its span covers the interval.
    pub(crate) fn add(
        &mut self,
        deadline: Instant,
        kind: TimerKind,
    ) -> Result<TimerHandle, DeadlineTooFar> {
        // An empty wheel re-bases on every poll, so `start` tracks the
        // present and the interval below stays tight.
        let interval = to_ms(deadline.saturating_duration_since(self.start));
        if interval >= wheel::span_ms(MAX_LEVEL) {
            return Err(DeadlineTooFar);
        }

        let mut root = self.root.take().unwrap_or_else(|| Wheel::new(0));
        while interval >= root.span_ms() {
            tracing::debug!(level = root.level() + 1, "timer wheel level up");
            root = Wheel::wrap(root);
        }

        let id = self.next_id;
        self.next_id += 1;
        root.add(TimerEntry { id, kind }, interval);
        self.root = Some(root);
        self.entries += 1;

        Ok(TimerHandle { id, deadline })
    }

    /// Unlinks an entry. A handle whose entry already fired is a no-op.
    pub(crate) fn remove(&mut self, handle: TimerHandle) {
        let Some(root) = self.root.as_mut() else {
            return;
        };

        let interval = to_ms(handle.deadline.saturating_duration_since(self.start));
        let elapsed = to_ms(self.start.elapsed());
        if interval <= elapsed || interval >= root.span_ms() {
            // Fired, about to fire, or never landed in this wheel.
            return;
        }

        if root.remove(handle.id, interval) {
            self.entries -= 1;
            self.try_level_down();
        }
    }

    /// Advances the wheel to `now` and returns everything that fired, in
    /// slot order.
    pub(crate) fn poll(&mut self, now: Instant) -> SmallVec<[TimerKind; 8]> {
        let mut fired = SmallVec::new();

        if self.entries == 0 {
            self.start = now;
            return fired;
        }

        let elapsed = to_ms(now.saturating_duration_since(self.start));
        if elapsed == 0 {
            return fired;
        }

        let mut out = SmallVec::<[TimerEntry; 8]>::new();
        let mut rotated = 0;
        if let Some(root) = self.root.as_mut() {
            root.fire(elapsed, &mut out);
            rotated = root.rotate_elapsed(elapsed);
        }

        // The basis only advances by what was rotated out; the sub-slot
        // remainder is folded into the next poll's elapsed time.
        self.start += Duration::from_millis(rotated);
        self.entries -= out.len().min(self.entries);
        if !out.is_empty() {
            self.try_level_down();
            tracing::trace!(fired = out.len(), remaining = self.entries, "timer poll");
        }

        fired.extend(out.into_iter().map(|entry| entry.kind));
        fired
    }

    /// Delay until the earliest pending entry, or `None` when the wheel is
    /// empty (the caller then waits without a timeout).
    pub(crate) fn next_deadline_ms(&self) -> Option<u64> {
        if self.entries == 0 {
            return None;
        }
        let offset = self.root.as_ref()?.next_deadline_offset()?;
        let elapsed = to_ms(self.start.elapsed());
        Some(offset.saturating_sub(elapsed))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Drops trailing empty top levels, and the root itself once the wheel
    /// has fully drained.
    fn try_level_down(&mut self) {
        while let Some(root) = self.root.take() {
            if root.is_empty() {
                tracing::debug!("timer wheel drained");
                break;
            }
            match root.try_unwrap() {
                Ok(child) => {
                    tracing::debug!(level = child.level(), "timer wheel level down");
                    self.root = Some(child);
                }
                Err(root) => {
                    self.root = Some(root);
                    break;
                }
            }
        }
    }
}

fn to_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Wake, Waker};

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

    fn at(timer: &Timer, ms: u64) -> Instant {
        timer.start + Duration::from_millis(ms)
    }

    #[test]
    fn test_fire_in_order() {
        let mut timer = Timer::new();
        let (waker, _) = counting_waker();

        for ms in [5u64, 1, 30] {
            timer
                .add(at(&timer, ms), TimerKind::IoTimeout(ms as usize))
                .unwrap();
        }
        timer.add(at(&timer, 10), TimerKind::Wake(waker)).unwrap();
        assert_eq!(timer.len(), 4);

        let fired = timer.poll(at(&timer, 64));
        let keys: Vec<_> = fired
            .iter()
            .map(|k| match k {
                TimerKind::IoTimeout(key) => *key as i64,
                TimerKind::Wake(_) => -1,
            })
            .collect();
        assert_eq!(keys, vec![1, 5, -1, 30]);
        assert!(timer.is_empty());
    }

    #[rstest]
    #[case::level_zero(40)]
    #[case::level_one(1_000)]
    #[case::level_two(200_000)]
    #[case::level_three(1 << 24)]
    fn test_round_trip_preserves_every_entry(#[case] max_ms: u64) {
        let mut timer = Timer::new();
        let intervals: Vec<u64> = (0..100).map(|i| (i * 7919) % max_ms).collect();

        for (key, ms) in intervals.iter().enumerate() {
            timer
                .add(at(&timer, *ms), TimerKind::IoTimeout(key))
                .unwrap();
        }

        // Drain in several steps to exercise cascading.
        let mut fired_keys = Vec::new();
        for step in 1..=4u64 {
            let now = at(&timer, step * max_ms / 4 + 1);
            for kind in timer.poll(now) {
                match kind {
                    TimerKind::IoTimeout(key) => fired_keys.push(key),
                    TimerKind::Wake(_) => unreachable!(),
                }
            }
        }

        fired_keys.sort_unstable();
        assert_eq!(fired_keys, (0..100).collect::<Vec<_>>());
        assert!(timer.is_empty());
    }

    #[test]
    fn test_never_fires_early() {
        let mut timer = Timer::new();
        timer.add(at(&timer, 100), TimerKind::IoTimeout(0)).unwrap();

        assert!(timer.poll(at(&timer, 50)).is_empty());
        assert!(timer.poll(at(&timer, 99)).is_empty());
        assert_eq!(timer.poll(at(&timer, 160)).len(), 1);
    }

    #[test]
    fn test_remove_before_fire() {
        let mut timer = Timer::new();
        let handle = timer.add(at(&timer, 50), TimerKind::IoTimeout(0)).unwrap();
        timer.add(at(&timer, 60), TimerKind::IoTimeout(1)).unwrap();

        timer.remove(handle);
        assert_eq!(timer.len(), 1);

        let fired = timer.poll(at(&timer, 128));
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], TimerKind::IoTimeout(1)));

        // Removing an already-fired handle is a no-op.
        timer.remove(handle);
    }

    #[test]
    fn test_deadline_too_far() {
        let mut timer = Timer::new();
        let too_far = at(&timer, wheel::span_ms(MAX_LEVEL));
        assert_eq!(
            timer.add(too_far, TimerKind::IoTimeout(0)).unwrap_err(),
            DeadlineTooFar
        );

        let just_fits = at(&timer, wheel::span_ms(MAX_LEVEL) - 1);
        assert!(timer.add(just_fits, TimerKind::IoTimeout(0)).is_ok());
    }

    #[test]
    fn test_wake_kind_wakes() {
        let mut timer = Timer::new();
        let (waker, count) = counting_waker();
        timer.add(at(&timer, 1), TimerKind::Wake(waker)).unwrap();

        for kind in timer.poll(at(&timer, 2)) {
            if let TimerKind::Wake(w) = kind {
                w.wake();
            }
        }
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_next_deadline_scans_levels() {
        let mut timer = Timer::new();
        assert_eq!(timer.next_deadline_ms(), None);

        timer.add(at(&timer, 5_000), TimerKind::IoTimeout(0)).unwrap();
        let delay = timer.next_deadline_ms().unwrap();
        // Slot granularity at level 1 is 64 ms; the reported delay must
        // never overshoot the true deadline.
        assert!(delay <= 5_000, "delay = {delay}");
        assert!(delay >= 5_000 - 64, "delay = {delay}");

        timer.add(at(&timer, 10), TimerKind::IoTimeout(1)).unwrap();
        assert!(timer.next_deadline_ms().unwrap() <= 10);
    }

    #[test]
    fn test_level_down_after_drain() {
        let mut timer = Timer::new();
        timer
            .add(at(&timer, 500_000), TimerKind::IoTimeout(0))
            .unwrap();
        timer.add(at(&timer, 10), TimerKind::IoTimeout(1)).unwrap();

        assert_eq!(timer.poll(at(&timer, 64)).len(), 1);
        assert_eq!(timer.len(), 1);

        // The far entry still fires at the right point after the root had a
        // chance to shrink.
        let fired = timer.poll(at(&timer, 500_000 + 64));
        assert_eq!(fired.len(), 1);
        assert!(timer.is_empty());
    }
}
