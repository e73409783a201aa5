use crate::time::sleep::Sleep;
use std::time::{Duration, Instant};

/// What a ticker does about ticks it slept through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedTickBehavior {
    /// Fire all missed ticks back to back until caught up.
    Burst,
    /// Restart the period from the moment the late tick was observed.
    Delay,
    /// Drop missed ticks and realign to the next natural period boundary.
    Skip,
}

/// A periodic timer; the first tick fires one period after creation.
pub fn interval(period: Duration) -> Interval {
    interval_at(Instant::now(), period)
}

/// A periodic timer whose first tick fires at `start + period`.
pub fn interval_at(start: Instant, period: Duration) -> Interval {
    assert!(!period.is_zero(), "interval period must be non-zero");
    Interval {
        deadline: start + period,
        period,
        behavior: MissedTickBehavior::Burst,
    }
}

#[derive(Debug)]
pub struct Interval {
    deadline: Instant,
    period: Duration,
    behavior: MissedTickBehavior,
}

impl Interval {
    /// Waits out the next tick.
    pub fn tick(&mut self) -> Sleep {
        let current = self.deadline;
        self.deadline = self.next_deadline();
        Sleep::new(current)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Next tick one period from now.
    pub fn reset(&mut self) {
        self.deadline = Instant::now() + self.period;
    }

    /// Next tick fires immediately.
    pub fn reset_immediately(&mut self) {
        self.deadline = Instant::now();
    }

    pub fn reset_after(&mut self, after: Duration) {
        self.deadline = Instant::now() + after;
    }

    pub fn reset_at(&mut self, deadline: Instant) {
        self.deadline = deadline;
    }

    pub fn missed_tick_behavior(&self) -> MissedTickBehavior {
        self.behavior
    }

    pub fn set_missed_tick_behavior(&mut self, behavior: MissedTickBehavior) {
        self.behavior = behavior;
    }

    fn next_deadline(&self) -> Instant {
        let now = Instant::now();
        match self.behavior {
            MissedTickBehavior::Burst => self.deadline + self.period,
            MissedTickBehavior::Delay => now + self.period,
            MissedTickBehavior::Skip => {
                if self.deadline >= now {
                    return self.deadline + self.period;
                }
                // Align to the next period boundary after now.
                let missed = now - self.deadline;
                let periods = missed.as_nanos() / self.period.as_nanos() + 1;
                self.deadline + self.period * periods as u32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_keeps_cadence() {
        let start = Instant::now();
        let mut interval = interval_at(start, Duration::from_millis(10));

        let first = interval.tick().deadline();
        let second = interval.tick().deadline();
        assert_eq!(first, start + Duration::from_millis(10));
        assert_eq!(second, start + Duration::from_millis(20));
    }

    #[test]
    fn test_skip_realigns_to_period_boundary() {
        // A deadline far in the past forces the skip path.
        let start = Instant::now() - Duration::from_millis(95);
        let mut interval = interval_at(start, Duration::from_millis(10));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let _ = interval.tick();
        let next = interval.tick().deadline();
        // The next deadline lands on a multiple of the period after start.
        let offset = next - start;
        assert_eq!(offset.as_millis() % 10, 0);
        assert!(next > Instant::now() - Duration::from_millis(10));
    }
}
