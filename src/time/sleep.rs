use crate::context;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// Suspends the current task for at least `duration`.
///
/// A zero (or already elapsed) duration still suspends once and
/// re-enqueues immediately, which makes `sleep(Duration::ZERO)` a
/// fairness yield for CPU-bound loops.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep::new(Instant::now() + duration)
}

/// Suspends the current task until `deadline`.
pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep::new(deadline)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SleepPhase {
    Init,
    /// Parked in the current worker's timing wheel.
    Registered,
    /// Deadline already due at first poll; one round through the ready
    /// queue before completing.
    Yielded,
    Done,
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[must_use = "sleeps do nothing unless awaited"]
#[derive(Debug)]
pub struct Sleep {
    deadline: Instant,
    phase: SleepPhase,
}

impl Sleep {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            phase: SleepPhase::Init,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match self.phase {
            SleepPhase::Init => {
                if self.deadline <= Instant::now() {
                    self.phase = SleepPhase::Yielded;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }

                let registered = context::with_engine_mut(|engine| {
                    engine.add_timer(self.deadline, cx.waker().clone())
                });
                if registered.is_err() {
                    // 64^7 ms is beyond any meaningful sleep; a request
                    // this far out is a bug at the call site.
                    panic!("sleep deadline exceeds the maximum timer span");
                }

                self.phase = SleepPhase::Registered;
                Poll::Pending
            }
            SleepPhase::Registered => {
                // Resumed by the wheel (or a stray wake); complete only
                // once the deadline truly passed. The wheel entry keeps
                // the original waker and fires on the owning worker.
                if self.deadline <= Instant::now() {
                    self.phase = SleepPhase::Done;
                    return Poll::Ready(());
                }
                Poll::Pending
            }
            SleepPhase::Yielded => {
                self.phase = SleepPhase::Done;
                Poll::Ready(())
            }
            SleepPhase::Done => Poll::Ready(()),
        }
    }
}
