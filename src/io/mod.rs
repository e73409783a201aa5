//! Asynchronous kernel operations.
//!
//! Every constructor here returns an [`Op`] future tied to the buffers it
//! references. Ops must be awaited on a runtime worker thread; the current
//! worker's ring carries the submission and its completion resumes the
//! task. Attach a deadline with [`Op::timeout`] / [`Op::timeout_at`].

mod errors;
pub use errors::IoError;

pub(crate) mod engine;
pub(crate) mod ring;
pub(crate) mod slab;
pub(crate) mod waker;

mod op;
pub use op::Op;

mod ops;
pub use ops::{
    accept, close, connect, fdatasync, fsync, nop, openat, read, readv, recv, recvmsg, send,
    send_to, sendmsg, shutdown, socket, write, writev,
};
