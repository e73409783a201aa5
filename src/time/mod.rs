//! Timers: sleeping, periodic ticks and I/O deadlines, all backed by the
//! per-worker timing wheel.

mod interval;
pub use interval::{Interval, MissedTickBehavior, interval, interval_at};

pub(crate) mod sleep;
pub use sleep::{Sleep, sleep, sleep_until};

use crate::io::Op;
use std::time::{Duration, Instant};

/// Bounds an I/O op by a relative timeout. Sugar for [`Op::timeout`].
pub fn timeout(interval: Duration, op: Op<'_>) -> Op<'_> {
    op.timeout(interval)
}

/// Bounds an I/O op by an absolute deadline. Sugar for [`Op::timeout_at`].
pub fn timeout_at(deadline: Instant, op: Op<'_>) -> Op<'_> {
    op.timeout_at(deadline)
}
