//! Coroutine-aware synchronization: tasks suspend, threads never block.

pub mod channel;
pub use channel::{Receiver, RecvError, SendError, Sender, bounded};

mod condvar;
pub use condvar::Condvar;

mod mutex;
pub use mutex::{Lock, Mutex};
