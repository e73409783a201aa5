use crate::runtime::Runtime;
use anyhow::{Result, anyhow};
use std::io;
use std::thread;

/// Default capacity of each worker's submission/completion rings.
const NUM_EVENTS: usize = 1024;

/// Prepared submissions between forced flushes.
const SUBMIT_INTERVAL: u32 = 4;

/// Worker loop ticks between forced I/O drives.
const IO_INTERVAL: u32 = 61;

/// Worker loop ticks between forced global queue polls.
const GLOBAL_QUEUE_INTERVAL: u32 = 61;

/// Configures and starts a [`Runtime`].
///
/// ```no_run
/// let runtime = riptide::Builder::new()
///     .num_workers(4)
///     .try_build()
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Worker thread count; defaults to the hardware parallelism.
    num_workers: Option<usize>,
    num_events: usize,
    submit_interval: u32,
    io_interval: u32,
    global_queue_interval: u32,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            num_workers: None,
            num_events: NUM_EVENTS,
            submit_interval: SUBMIT_INTERVAL,
            io_interval: IO_INTERVAL,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
        }
    }

    #[track_caller]
    pub fn num_workers(mut self, val: usize) -> Self {
        assert!(val > 0, "num_workers must be greater than 0");
        self.num_workers = Some(val);
        self
    }

    /// Capacity of each worker's submission/completion rings.
    #[track_caller]
    pub fn num_events(mut self, val: usize) -> Self {
        assert!(val > 0, "num_events must be greater than 0");
        self.num_events = val;
        self
    }

    /// How many staged submissions accumulate before a forced flush to the
    /// kernel. Lower is lower latency, higher is fewer syscalls.
    #[track_caller]
    pub fn submit_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "submit_interval must be greater than 0");
        self.submit_interval = val;
        self
    }

    /// Worker loop ticks between forced drives of the I/O engine.
    #[track_caller]
    pub fn io_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "io_interval must be greater than 0");
        self.io_interval = val;
        self
    }

    /// Worker loop ticks between forced polls of the global queue, even
    /// while local work is available. Lower values favor fairness to
    /// external submitters.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    /// Starts the runtime: spawns the worker threads and returns once all
    /// of them are initialized.
    pub fn try_build(self) -> Result<Runtime> {
        let config: RuntimeConfig = self.try_into()?;
        Runtime::try_new_with(config)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) num_workers: usize,
    pub(crate) num_events: usize,
    pub(crate) submit_interval: u32,
    pub(crate) io_interval: u32,
    pub(crate) global_queue_interval: u32,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(anyhow!("num_workers must be greater than 0"));
        }
        if self.num_events == 0 {
            return Err(anyhow!("num_events must be greater than 0"));
        }

        // Each worker pins an eventfd plus a ring's worth of descriptors.
        check_fd_ulimit(self.num_workers * (self.num_events + 2))?;

        Ok(())
    }
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        let num_workers = match builder.num_workers {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let config = RuntimeConfig {
            num_workers,
            num_events: builder.num_events,
            submit_interval: builder.submit_interval,
            io_interval: builder.io_interval,
            global_queue_interval: builder.global_queue_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Checks the soft open-file limit against what the configuration may pin.
fn check_fd_ulimit(desired_fds: usize) -> io::Result<()> {
    let mut rlimit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let rlimit = unsafe { rlimit.assume_init() };
    let current_limit = rlimit.rlim_cur as usize;

    if desired_fds > current_limit {
        return Err(io::Error::other(format!(
            "the configuration may require {desired_fds} file descriptors but the current \
             ulimit is {current_limit}; raise it (e.g. 'ulimit -n 65536') or shrink \
             num_workers/num_events"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    // The config crosses into every spawned worker thread.
    assert_impl_all!(RuntimeConfig: Send, Sync, Clone);

    #[test]
    fn test_builder_applies_values() {
        let builder = Builder::new()
            .num_workers(2)
            .num_events(2048)
            .submit_interval(3)
            .io_interval(5)
            .global_queue_interval(7);

        let config: RuntimeConfig = builder.try_into().unwrap();
        assert_eq!(config.num_workers, 2);
        assert_eq!(config.num_events, 2048);
        assert_eq!(config.submit_interval, 3);
        assert_eq!(config.io_interval, 5);
        assert_eq!(config.global_queue_interval, 7);
    }

    #[test]
    fn test_default_workers_match_parallelism() {
        let config: RuntimeConfig = Builder::new().try_into().unwrap();
        assert_eq!(
            config.num_workers,
            thread::available_parallelism().unwrap().get()
        );
    }

    #[test]
    #[should_panic(expected = "num_workers must be greater than 0")]
    fn test_zero_workers_rejected() {
        let _ = Builder::new().num_workers(0);
    }
}
