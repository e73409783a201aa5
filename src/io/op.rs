use crate::context;
use crate::io::IoError;
use crate::io::slab::OpCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

/// One asynchronous kernel operation.
///
/// Created by the constructors in [`crate::io`]; awaiting it stages the
/// prepared entry on the current worker's ring and suspends until the
/// completion (or the attached deadline) arrives. The lifetime ties the
/// future to the buffers referenced by the entry.
///
/// After a [`IoError::TimedOut`] resume the kernel may still be finishing
/// the cancelled op; the referenced buffers must not be repurposed until
/// the enclosing scope ends.
#[must_use = "ops do nothing unless awaited"]
pub struct Op<'a> {
    entry: Option<io_uring::squeue::Entry>,
    deadline: Option<Instant>,
    cell: Option<Arc<OpCell>>,
    _buffers: PhantomData<&'a mut ()>,
}

impl<'a> Op<'a> {
    pub(crate) fn new(entry: io_uring::squeue::Entry) -> Self {
        Self {
            entry: Some(entry),
            deadline: None,
            cell: None,
            _buffers: PhantomData,
        }
    }

    /// Bounds the op by a relative timeout. When the timer fires first the
    /// op resumes with [`IoError::TimedOut`] and a kernel-level cancel is
    /// submitted for it.
    pub fn timeout(self, interval: Duration) -> Self {
        self.timeout_at(Instant::now() + interval)
    }

    /// Bounds the op by an absolute deadline.
    pub fn timeout_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl Future for Op<'_> {
    type Output = Result<i32, IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(cell) = &this.cell {
            let result = cell.poll_result(cx.waker());
            if result.is_ready() {
                this.cell = None;
            }
            return result;
        }

        let entry = this
            .entry
            .take()
            .expect("op polled again after completion");

        let staged =
            context::with_engine_mut(|engine| engine.submit_op(entry, this.deadline, cx.waker()));

        match staged {
            Ok(cell) => {
                this.cell = Some(cell);
                Poll::Pending
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        // The op may still be in flight; the engine discards its completion.
        if let Some(cell) = self.cell.take() {
            cell.abandon();
        }
    }
}
