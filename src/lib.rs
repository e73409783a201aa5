//! riptide — a multi-threaded work-stealing async runtime for Linux,
//! driving stackless coroutines over io_uring.
//!
//! Each worker thread owns a ring, an eventfd waker, a hierarchical timing
//! wheel and a bounded local run queue; a shared global queue and a
//! wake-up state machine tie them together. [`Runtime::block_on`] blocks
//! the calling thread until the submitted coroutine and everything it
//! transitively [`spawn`]ed has finished.
//!
//! ```no_run
//! let runtime = riptide::Runtime::try_new().unwrap();
//!
//! let out = runtime.block_on(async {
//!     riptide::time::sleep(std::time::Duration::from_millis(10)).await;
//!     42
//! });
//! assert_eq!(out, 42);
//! ```
//!
//! Worker threads never block except inside the kernel wait; user code
//! must not issue synchronous blocking syscalls on them, or that worker
//! stalls until the call returns.

pub(crate) mod context;

pub mod io;

pub mod runtime;
pub use runtime::{Builder, Runtime, spawn};

pub mod sync;

pub(crate) mod task;

pub mod time;

pub(crate) mod timer;

pub(crate) mod utils;
