use anyhow::Result;
use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{IoUring, cqueue, squeue};
use smallvec::SmallVec;
use std::io;
use std::time::Duration;

/// Thin wrapper over one `io_uring` instance. Owned by a single worker
/// thread; only the eventfd write path is touched cross-thread.
pub(crate) struct Ring {
    ring: IoUring,
}

impl Ring {
    pub(crate) fn try_new(entries: u32) -> Result<Self> {
        let ring = IoUring::builder().build(entries)?;

        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP is not available; the kernel may drop completions when the CQ ring is full"
            );
        }

        Ok(Self { ring })
    }

    /// Stages one entry. Fails when the submission ring is full.
    ///
    /// Safety contract with callers: the buffers referenced by `entry` must
    /// stay valid until its completion is reaped.
    pub(crate) fn push(&mut self, entry: &squeue::Entry) -> Result<(), ()> {
        unsafe { self.ring.submission().push(entry).map_err(|_| ()) }
    }

    pub(crate) fn unsubmitted(&mut self) -> usize {
        self.ring.submission().len()
    }

    /// Hands every staged entry to the kernel without waiting.
    pub(crate) fn submit(&mut self) -> io::Result<usize> {
        self.ring.submission().sync();
        self.ring.submitter().submit()
    }

    /// Submits staged entries and blocks until at least `want` completions
    /// arrive, the optional timeout elapses, or an external wake lands.
    pub(crate) fn submit_and_wait(
        &mut self,
        want: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        self.ring.submission().sync();

        if let Some(duration) = timeout {
            let ts = Timespec::from(duration);
            let args = SubmitArgs::new().timespec(&ts);
            return self.ring.submitter().submit_with_args(want, &args);
        }

        self.ring.submitter().submit_and_wait(want)
    }

    /// Drains up to `max` completions in the order the kernel posted them.
    pub(crate) fn completions(&mut self, max: usize) -> SmallVec<[cqueue::Entry; 32]> {
        let mut cq = self.ring.completion();
        cq.sync();
        let batch: SmallVec<[cqueue::Entry; 32]> = cq.by_ref().take(max).collect();
        cq.sync();
        batch
    }
}
