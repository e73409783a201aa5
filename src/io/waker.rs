use anyhow::Result;
use nix::sys::eventfd::{EfdFlags, EventFd};
use std::os::fd::{AsFd, AsRawFd, RawFd};

/// Cross-thread wake-up for a parked worker.
///
/// The worker keeps a read on this eventfd armed in its ring; any thread
/// can complete that read by writing here, which pops the worker out of
/// its kernel wait.
pub(crate) struct EventWaker {
    fd: EventFd,
}

impl std::fmt::Debug for EventWaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWaker").field("fd", &self.raw_fd()).finish()
    }
}

impl EventWaker {
    pub(crate) fn new() -> Result<Self> {
        let fd = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        Ok(Self { fd })
    }

    /// Idempotent across many wakes between reads: the eventfd counter
    /// coalesces them, and a counter at max (EAGAIN) already implies a
    /// pending wake.
    pub(crate) fn wake(&self) {
        if let Err(err) = self.fd.write(1)
            && err != nix::errno::Errno::EAGAIN
        {
            tracing::error!(?err, "eventfd wake failed");
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_fd().as_raw_fd()
    }
}
