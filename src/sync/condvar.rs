//! Condition variable for tasks, paired with [`Mutex`].
//!
//! Waiters park on a LIFO stack of nodes owned by their pinned futures.
//! Enqueueing happens while the companion mutex is still held and the
//! mutex is released only afterwards, so a notify between unlock and
//! suspend cannot be lost. Spurious wakeups are permitted; the predicate
//! loop in [`Condvar::wait`] absorbs them.

use crate::sync::Mutex;
use parking_lot::Mutex as PlainMutex;
use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
pub struct Condvar {
    waiters: AtomicPtr<CvWaiter>,
}

#[derive(Debug)]
struct CvWaiter {
    waker: PlainMutex<Option<Waker>>,
    next: Cell<*mut CvWaiter>,
    notified: AtomicBool,
    _pin: PhantomPinned,
}

// Safety: nodes are shared between the waiting task and notifiers; `next`
// is only touched while the node is owned by the stack or by the notifier
// that detached it.
unsafe impl Send for CvWaiter {}
unsafe impl Sync for CvWaiter {}

impl Condvar {
    pub fn new() -> Self {
        Self {
            waiters: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Waits until `predicate` holds. The caller must hold `mutex`; it is
    /// released while suspended and re-held when this returns.
    pub async fn wait<P>(&self, mutex: &Mutex, mut predicate: P)
    where
        P: FnMut() -> bool,
    {
        while !predicate() {
            CvWait {
                condvar: self,
                mutex,
                waiter: CvWaiter {
                    waker: PlainMutex::new(None),
                    next: Cell::new(ptr::null_mut()),
                    notified: AtomicBool::new(false),
                    _pin: PhantomPinned,
                },
                phase: WaitPhase::Init,
                _pin: PhantomPinned,
            }
            .await;
            mutex.lock().await;
        }
    }

    /// Wakes one waiter. Both signal-before-unlock and unlock-before-signal
    /// are legal; the waiter re-checks its predicate either way.
    pub fn notify_one(&self) {
        // Detach the whole stack: popping a single node with CAS would race
        // a re-enqueued node reusing the same address. Untouched waiters
        // are pushed back below.
        let head = self.waiters.swap(ptr::null_mut(), Ordering::AcqRel);
        if head.is_null() {
            return;
        }

        // Safety: detached nodes are exclusively ours; read the remainder
        // chain before waking, after which the node may be freed.
        let rest = unsafe { (*head).next.get() };
        Self::resume(head);

        let mut cursor = rest;
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next.get() };
            self.push(cursor);
            cursor = next;
        }
    }

    /// Wakes every waiter currently enqueued.
    pub fn notify_all(&self) {
        let mut cursor = self.waiters.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            // Safety: read the chain link before waking; the node may be
            // freed as soon as its task resumes.
            let next = unsafe { (*cursor).next.get() };
            Self::resume(cursor);
            cursor = next;
        }
    }

    fn resume(node: *mut CvWaiter) {
        // Safety: caller guarantees exclusive ownership of the detached
        // node until `notified` is published.
        unsafe {
            let waker = (*node).waker.lock().take();
            (*node).notified.store(true, Ordering::Release);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    fn push(&self, node: *mut CvWaiter) {
        let mut cur = self.waiters.load(Ordering::Relaxed);
        loop {
            // Safety: we own `node` until the CAS succeeds.
            unsafe { (*node).next.set(cur) };
            match self
                .waiters
                .compare_exchange_weak(cur, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum WaitPhase {
    Init,
    Waiting,
    Done,
}

/// One parked waiter: enqueues itself and releases the mutex on first
/// poll, resumes once notified.
struct CvWait<'a> {
    condvar: &'a Condvar,
    mutex: &'a Mutex,
    waiter: CvWaiter,
    phase: WaitPhase,
    _pin: PhantomPinned,
}

impl Future for CvWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: pinned; the node address is stable and never moved out.
        let this = unsafe { self.get_unchecked_mut() };

        match this.phase {
            WaitPhase::Init => {
                *this.waiter.waker.lock() = Some(cx.waker().clone());
                this.phase = WaitPhase::Waiting;

                let node = &this.waiter as *const CvWaiter as *mut CvWaiter;
                this.condvar.push(node);

                // Only now does the lock drop: anyone acquiring it and
                // signalling will find us on the stack.
                this.mutex.unlock();
                Poll::Pending
            }
            WaitPhase::Waiting => {
                if this.waiter.notified.load(Ordering::Acquire) {
                    this.phase = WaitPhase::Done;
                    return Poll::Ready(());
                }
                *this.waiter.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
            WaitPhase::Done => Poll::Ready(()),
        }
    }
}

impl Drop for CvWait<'_> {
    fn drop(&mut self) {
        if self.phase == WaitPhase::Waiting && !self.waiter.notified.load(Ordering::Acquire) {
            tracing::error!("condvar wait dropped while enqueued");
            std::process::abort();
        }
    }
}
