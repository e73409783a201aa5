use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TickerEvents: u8 {
        /// Drive the I/O engine and refresh the shutdown flag.
        const DRIVE_IO = 1;

        /// Poll the global queue ahead of the local queue, so globally
        /// queued work cannot be starved by a long local run.
        const POLL_GLOBAL = 1 << 1;
    }
}

/// Counts loop iterations and turns the configured intervals into events.
#[derive(Debug)]
pub(crate) struct Ticker {
    tick: u32,
    io_interval: u32,
    global_queue_interval: u32,
}

impl Ticker {
    pub(crate) fn new(io_interval: u32, global_queue_interval: u32) -> Self {
        debug_assert!(io_interval > 0 && global_queue_interval > 0);
        Self {
            tick: 0,
            io_interval,
            global_queue_interval,
        }
    }

    pub(crate) fn tick(&mut self) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);

        let mut events = TickerEvents::empty();
        if self.tick % self.io_interval == 0 {
            events.insert(TickerEvents::DRIVE_IO);
        }
        if self.tick % self.global_queue_interval == 0 {
            events.insert(TickerEvents::POLL_GLOBAL);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intervals_fire_on_multiples() {
        let mut ticker = Ticker::new(2, 3);

        assert_eq!(ticker.tick(), TickerEvents::empty());
        assert_eq!(ticker.tick(), TickerEvents::DRIVE_IO);
        assert_eq!(ticker.tick(), TickerEvents::POLL_GLOBAL);
        assert_eq!(ticker.tick(), TickerEvents::DRIVE_IO);
        assert_eq!(ticker.tick(), TickerEvents::empty());
        assert_eq!(
            ticker.tick(),
            TickerEvents::DRIVE_IO | TickerEvents::POLL_GLOBAL
        );
    }
}
