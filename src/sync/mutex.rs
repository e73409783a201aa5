//! Coroutine-suspending mutex.
//!
//! The entire lock state is one atomic pointer: null means unlocked, the
//! mutex's own address is the locked-without-waiters sentinel, and any
//! other value is the head of a LIFO stack of waiter nodes living inside
//! the pinned lock futures. Unlock drains the stack into a FIFO so waiters
//! acquire in the order they enqueued, while the uncontended paths stay a
//! single compare-and-swap.

use parking_lot::Mutex as PlainMutex;
use std::cell::{Cell, UnsafeCell};
use std::future::Future;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::task::{Context, Poll, Waker};

/// A nonrecursive async mutex. `lock().await` suspends the task instead of
/// the thread; `unlock` hands the lock directly to the eldest waiter.
///
/// Unlocking an unlocked mutex is a fatal error, and locking reentrantly
/// from the same task deadlocks it.
#[derive(Debug)]
pub struct Mutex {
    /// null = unlocked; self-sentinel = locked, no waiters; otherwise the
    /// head of the waiter stack (and the mutex is locked).
    state: AtomicPtr<Waiter>,

    /// Waiters already drained into FIFO order, pending grants. Only the
    /// current lock holder touches this during unlock, which is what makes
    /// the plain cell sound.
    fifo: UnsafeCell<*mut Waiter>,
}

// Safety: `state` transitions are atomic and `fifo` is only accessed by
// the thread currently holding the lock.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

#[derive(Debug)]
struct Waiter {
    waker: PlainMutex<Option<Waker>>,
    next: Cell<*mut Waiter>,
    granted: AtomicBool,
    _pin: PhantomPinned,
}

// Safety: a waiter is shared between the enqueuing task and the unlocking
// task; `next` is only touched while the node is owned by the stack or the
// unlocker.
unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}

impl Mutex {
    pub fn new() -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
            fifo: UnsafeCell::new(ptr::null_mut()),
        }
    }

    fn sentinel(&self) -> *mut Waiter {
        self as *const Mutex as *mut Waiter
    }

    /// Single-CAS acquire; never suspends.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(
                ptr::null_mut(),
                self.sentinel(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Acquires the lock, suspending the task while another holds it.
    pub fn lock(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            waiter: Waiter {
                waker: PlainMutex::new(None),
                next: Cell::new(ptr::null_mut()),
                granted: AtomicBool::new(false),
                _pin: PhantomPinned,
            },
            phase: LockPhase::Init,
            _pin: PhantomPinned,
        }
    }

    /// Releases the lock. When waiters are queued the lock is handed
    /// directly to the eldest one; the mutex never becomes observably
    /// unlocked in between.
    pub fn unlock(&self) {
        let sentinel = self.sentinel();

        if self.state.load(Ordering::Relaxed).is_null() {
            tracing::error!("unlock of an unlocked mutex");
            std::process::abort();
        }

        // Safety: we hold the lock, so we are the only unlock in flight.
        let fifo = unsafe { &mut *self.fifo.get() };

        if fifo.is_null() {
            let cur = self.state.load(Ordering::Relaxed);
            if cur == sentinel
                && self
                    .state
                    .compare_exchange(sentinel, ptr::null_mut(), Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }

            // Waiters arrived: take the whole stack while keeping the
            // mutex locked, then reverse it so grants go out in enqueue
            // order.
            let mut lifo = self.state.swap(sentinel, Ordering::Acquire);
            debug_assert!(!lifo.is_null() && lifo != sentinel);

            let mut head: *mut Waiter = ptr::null_mut();
            while !lifo.is_null() {
                // Safety: nodes in the detached stack are exclusively ours
                // until granted.
                let next = unsafe { (*lifo).next.get() };
                unsafe { (*lifo).next.set(head) };
                head = lifo;
                lifo = next;
            }
            *fifo = head;
        }

        let head = *fifo;
        debug_assert!(!head.is_null());
        // Safety: `head` stays valid until `granted` is set below; read
        // everything we need first.
        unsafe {
            *fifo = (*head).next.get();
            let waker = (*head).waker.lock().take();
            (*head).granted.store(true, Ordering::Release);
            // Past this point the waiter may already be running and its
            // node gone; only the cloned waker is touched.
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LockPhase {
    Init,
    Waiting,
    Done,
}

/// Future returned by [`Mutex::lock`].
#[must_use = "the lock is only acquired by awaiting"]
pub struct Lock<'a> {
    mutex: &'a Mutex,
    waiter: Waiter,
    phase: LockPhase,
    _pin: PhantomPinned,
}

impl Future for Lock<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: the future is pinned; the waiter node address is stable
        // and nothing here moves out of it.
        let this = unsafe { self.get_unchecked_mut() };

        match this.phase {
            LockPhase::Init => {
                *this.waiter.waker.lock() = Some(cx.waker().clone());

                let sentinel = this.mutex.sentinel();
                let node = &this.waiter as *const Waiter as *mut Waiter;
                let mut cur = this.mutex.state.load(Ordering::Relaxed);
                loop {
                    if cur.is_null() {
                        // Fast path: grab the free lock.
                        match this.mutex.state.compare_exchange_weak(
                            cur,
                            sentinel,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                this.phase = LockPhase::Done;
                                return Poll::Ready(());
                            }
                            Err(actual) => cur = actual,
                        }
                    } else {
                        // Contended: push ourselves onto the waiter stack.
                        this.waiter
                            .next
                            .set(if cur == sentinel { ptr::null_mut() } else { cur });
                        match this.mutex.state.compare_exchange_weak(
                            cur,
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => {
                                this.phase = LockPhase::Waiting;
                                return Poll::Pending;
                            }
                            Err(actual) => cur = actual,
                        }
                    }
                }
            }
            LockPhase::Waiting => {
                if this.waiter.granted.load(Ordering::Acquire) {
                    this.phase = LockPhase::Done;
                    return Poll::Ready(());
                }
                *this.waiter.waker.lock() = Some(cx.waker().clone());
                Poll::Pending
            }
            LockPhase::Done => Poll::Ready(()),
        }
    }
}

impl Drop for Lock<'_> {
    fn drop(&mut self) {
        // An enqueued waiter node lives inside this future; freeing it
        // while the mutex can still reach it would corrupt the stack. The
        // runtime has no task cancellation, so this only fires on misuse.
        if self.phase == LockPhase::Waiting && !self.waiter.granted.load(Ordering::Acquire) {
            tracing::error!("lock future dropped while enqueued on the mutex");
            std::process::abort();
        }
    }
}
