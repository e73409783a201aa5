//! Per-worker I/O engine: one ring, one eventfd waker, one timing wheel
//! and the table of in-flight ops.

use crate::io::ring::Ring;
use crate::io::slab::{CANCEL_TOKEN, OpCell, OpSlab, WAKER_TOKEN};
use crate::io::waker::EventWaker;
use crate::io::IoError;
use crate::runtime::RuntimeConfig;
use crate::timer::{Timer, TimerKind};
use anyhow::Result;
use io_uring::opcode;
use io_uring::types::Fd;
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

pub(crate) struct IoEngine {
    ring: Ring,
    slab: OpSlab,
    timer: Timer,

    waker: Arc<EventWaker>,
    /// Landing buffer for the armed eventfd read. The engine never moves
    /// after worker init, so the address stays stable.
    waker_buf: Box<u64>,
    waker_armed: bool,

    submit_interval: u32,
    submit_tick: u32,
}

impl IoEngine {
    pub(crate) fn try_new(cfg: &RuntimeConfig, waker: Arc<EventWaker>) -> Result<Self> {
        Ok(Self {
            ring: Ring::try_new(cfg.num_events as u32)?,
            slab: OpSlab::new(cfg.num_events),
            timer: Timer::new(),
            waker,
            waker_buf: Box::new(0),
            waker_armed: false,
            submit_interval: cfg.submit_interval,
            submit_tick: 0,
        })
    }

    /// Stages one op: allocates its descriptor, arms the optional deadline
    /// and pushes the entry. Submission to the kernel is batched on
    /// `submit_interval` preparations.
    pub(crate) fn submit_op(
        &mut self,
        entry: io_uring::squeue::Entry,
        deadline: Option<Instant>,
        waker: &Waker,
    ) -> Result<Arc<OpCell>, IoError> {
        let cell = OpCell::new(waker.clone());
        let key = self.slab.insert(cell.clone());

        // Arm the deadline first so a push failure can unwind both.
        if let Some(deadline) = deadline {
            match self.timer.add(deadline, TimerKind::IoTimeout(key)) {
                Ok(handle) => {
                    self.slab
                        .get_mut(key)
                        .expect("slot just inserted")
                        .timer = Some(handle);
                }
                Err(_) => {
                    self.slab.remove(key);
                    return Err(IoError::DeadlineTooFar);
                }
            }
        }

        let entry = entry.user_data(key as u64);
        if self.ring.push(&entry).is_err() {
            // Flush staged entries and retry once before giving up.
            let _ = self.ring.submit();
            if self.ring.push(&entry).is_err() {
                let removed = self.slab.remove(key).expect("slot just inserted");
                if let Some(handle) = removed.timer {
                    self.timer.remove(handle);
                }
                return Err(IoError::SqRingFull);
            }
        }

        self.submit_tick += 1;
        if self.submit_tick >= self.submit_interval {
            self.flush();
        }

        Ok(cell)
    }

    /// Registers a plain wake-up with the wheel (the sleep path).
    pub(crate) fn add_timer(
        &mut self,
        deadline: Instant,
        waker: Waker,
    ) -> Result<(), crate::timer::DeadlineTooFar> {
        self.timer.add(deadline, TimerKind::Wake(waker))?;
        Ok(())
    }

    /// Reaps completions, fires due timers, re-arms the eventfd and submits
    /// the pending batch. Returns whether any task was made runnable.
    pub(crate) fn drive(&mut self) -> bool {
        let mut produced = 0;

        for cqe in self.ring.completions(256) {
            match cqe.user_data() {
                WAKER_TOKEN => {
                    // Wake consumed; re-armed below.
                    self.waker_armed = false;
                }
                CANCEL_TOKEN => {}
                key => {
                    let Some(entry) = self.slab.remove(key as usize) else {
                        tracing::error!(key, "completion for unknown op");
                        continue;
                    };
                    if let Some(handle) = entry.timer {
                        self.timer.remove(handle);
                    }
                    entry.cell.complete(cqe.result());
                    produced += 1;
                }
            }
        }

        for kind in self.timer.poll(Instant::now()) {
            match kind {
                TimerKind::Wake(waker) => waker.wake(),
                TimerKind::IoTimeout(key) => self.fire_io_timeout(key),
            }
            produced += 1;
        }

        self.arm_waker();
        self.flush();

        produced > 0
    }

    /// Blocks in the kernel until a completion, an eventfd wake, or the
    /// timeout. The eventfd read was armed by the preceding `drive`.
    pub(crate) fn wait(&mut self, timeout_ms: Option<u64>) {
        let timeout = timeout_ms.map(Duration::from_millis);
        if let Err(err) = self.ring.submit_and_wait(1, timeout) {
            match err.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) => {}
                _ => tracing::error!(?err, "io wait failed"),
            }
        }
    }

    pub(crate) fn next_deadline_ms(&self) -> Option<u64> {
        self.timer.next_deadline_ms()
    }

    /// The wheel fired before the kernel: mark the descriptor timed out and
    /// ask the kernel to cancel the op. Its completion still arrives
    /// (either the original result or ECANCELED) and clears the slab slot.
    fn fire_io_timeout(&mut self, key: usize) {
        let Some(entry) = self.slab.get_mut(key) else {
            return;
        };
        entry.timer = None;

        if entry.cell.mark_timed_out() {
            let cancel = opcode::AsyncCancel::new(key as u64)
                .build()
                .user_data(CANCEL_TOKEN);
            if self.ring.push(&cancel).is_err() {
                // No room for the cancel; the op simply runs to its natural
                // completion, which is ignored.
                tracing::warn!(key, "no SQ space for timeout cancel");
            }
        }
    }

    /// Keeps exactly one eventfd read armed.
    fn arm_waker(&mut self) {
        if self.waker_armed {
            return;
        }
        let buf = &mut *self.waker_buf as *mut u64;
        let entry = opcode::Read::new(Fd(self.waker.raw_fd()), buf.cast::<u8>(), 8)
            .build()
            .user_data(WAKER_TOKEN);
        if self.ring.push(&entry).is_ok() {
            self.waker_armed = true;
        }
    }

    /// Hands the staged batch to the kernel and resets the batching tick.
    fn flush(&mut self) {
        self.submit_tick = 0;
        if self.ring.unsubmitted() == 0 {
            return;
        }
        if let Err(err) = self.ring.submit() {
            tracing::error!(?err, "sqe submit failed");
        }
    }
}
