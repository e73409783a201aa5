use std::io;

/// Errors surfaced by I/O awaiters.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The submission queue was still full after a forced flush. The
    /// operation was never handed to the kernel.
    #[error("submission queue is full, cannot stage IO")]
    SqRingFull,

    /// The deadline attached to this op fired before the kernel completed
    /// it. A kernel-level cancel has been submitted on the caller's behalf.
    #[error("operation timed out")]
    TimedOut,

    /// The requested timeout exceeds the maximum timer span.
    #[error("timeout deadline exceeds the maximum timer span")]
    DeadlineTooFar,

    /// The kernel failed the operation; carries the decoded errno.
    #[error("I/O error: {0}")]
    Os(#[from] io::Error),
}

impl IoError {
    /// Decodes a negative CQE result.
    pub(crate) fn from_raw(result: i32) -> IoError {
        debug_assert!(result < 0);
        IoError::Os(io::Error::from_raw_os_error(-result))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IoError::TimedOut)
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SqRingFull, Self::SqRingFull) => true,
            (Self::TimedOut, Self::TimedOut) => true,
            (Self::DeadlineTooFar, Self::DeadlineTooFar) => true,
            (Self::Os(a), Self::Os(b)) => a.raw_os_error() == b.raw_os_error(),
            _ => false,
        }
    }
}
