//! Per-worker bounded run queue and the shared global queue.
//!
//! The local queue is a fixed 256-slot ring. The owning worker pushes and
//! pops at the tail; other workers steal batches from the head. The head is
//! a packed pair of `u32` indices: the low half is the "real" head, the
//! high half is the index a stealer is currently copying from. While the
//! two halves differ a steal is in progress and no other consumer may claim
//! tasks from the head. Tracking the in-progress stealer prevents the owner
//! from recycling slots that have been claimed but not yet copied out.
//!
//! All consumer-side accesses use `SeqCst`: the owner's tail-pop publishes
//! the shrunken tail before inspecting the head, and stealers must observe
//! that store before computing a claim, otherwise a stale tail could let a
//! claim reach the slot the owner just popped.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;
const MASK: usize = LOCAL_QUEUE_CAPACITY - 1;

/// Producer handle. May only be used from the owning worker thread.
pub(crate) struct Local<T> {
    inner: Arc<Inner<T>>,
}

/// Consumer handle for other workers. May be used from many threads.
pub(crate) struct Steal<T>(Arc<Inner<T>>);

struct Inner<T> {
    /// Packed (steal, real) head indices, see module docs. The indices are
    /// wider than needed for buffer addressing so that full and empty rings
    /// can be told apart and index reuse is mitigated.
    head: AtomicU64,

    /// Only written by the owner, read by stealers.
    tail: AtomicU32,

    buffer: Box<[UnsafeCell<MaybeUninit<T>>; LOCAL_QUEUE_CAPACITY]>,
}

// Safety: slots are handed between threads only through the head/tail
// protocol above; a slot is read by exactly one claimant.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// Destination for tasks evicted when a local queue overflows.
pub(crate) trait Overflow<T> {
    fn push_batch(&self, batch: impl Iterator<Item = T>);
}

pub(crate) fn local<T>() -> (Steal<T>, Local<T>) {
    let mut buffer = Vec::with_capacity(LOCAL_QUEUE_CAPACITY);
    for _ in 0..LOCAL_QUEUE_CAPACITY {
        buffer.push(UnsafeCell::new(MaybeUninit::uninit()));
    }

    // The contents are not Copy, so the fixed-size array is produced by
    // casting the boxed slice after checking the length.
    let buffer: Box<[UnsafeCell<MaybeUninit<T>>]> = buffer.into_boxed_slice();
    assert_eq!(buffer.len(), LOCAL_QUEUE_CAPACITY);
    let buffer = unsafe { Box::from_raw(Box::into_raw(buffer).cast()) };

    let inner = Arc::new(Inner {
        head: AtomicU64::new(0),
        tail: AtomicU32::new(0),
        buffer,
    });

    (Steal(inner.clone()), Local { inner })
}

impl<T> Local<T> {
    pub(crate) fn len(&self) -> usize {
        self.inner.len() as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots that can still be filled without overflowing. Computed against
    /// the steal index so slots under an in-progress steal stay reserved.
    pub(crate) fn remaining_slots(&self) -> usize {
        let (steal, _) = unpack(self.inner.head.load(Ordering::Acquire));
        let tail = self.inner.tail.load(Ordering::Acquire);

        LOCAL_QUEUE_CAPACITY - (tail.wrapping_sub(steal) as usize)
    }

    /// Pops the most recently pushed task from the tail.
    pub(crate) fn pop(&mut self) -> Option<T> {
        // Safety: this is the only thread that updates the tail.
        let prev = unsafe { ptr::read(self.inner.tail.as_ptr()) };
        let (_, real) = unpack(self.inner.head.load(Ordering::SeqCst));

        if real == prev {
            return None;
        }

        // Publish the shrunken tail before re-inspecting the head. Stealers
        // loading the tail after this store can no longer size a claim that
        // reaches the popped slot.
        let tail = prev.wrapping_sub(1);
        self.inner.tail.store(tail, Ordering::SeqCst);

        let mut prev_packed = self.inner.head.load(Ordering::SeqCst);
        loop {
            let (steal, real) = unpack(prev_packed);

            if real == prev {
                // Stealers drained the queue in the window above; undo.
                self.inner.tail.store(prev, Ordering::SeqCst);
                return None;
            }

            if real == tail {
                // One task left. A stealer that sized its claim against the
                // old tail may be racing us for it, so claim through the
                // head like a stealer would.
                let next_real = real.wrapping_add(1);
                let next = if steal == real {
                    pack(next_real, next_real)
                } else {
                    pack(steal, next_real)
                };

                let res = self.inner.head.compare_exchange(
                    prev_packed,
                    next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );

                match res {
                    Ok(_) => {
                        // The ring is now empty; line the tail back up with
                        // the advanced head.
                        self.inner.tail.store(prev, Ordering::SeqCst);
                        let task =
                            unsafe { ptr::read(self.inner.buffer[tail as usize & MASK].get()) };
                        return Some(unsafe { task.assume_init() });
                    }
                    Err(actual) => {
                        prev_packed = actual;
                        continue;
                    }
                }
            }

            // At least one task remains below the tail slot. No claim sized
            // against any published tail can cover it, so it is ours.
            let task = unsafe { ptr::read(self.inner.buffer[tail as usize & MASK].get()) };
            return Some(unsafe { task.assume_init() });
        }
    }

    /// Pushes a task at the tail, spilling half the queue into `overflow`
    /// when the ring is full.
    pub(crate) fn push_or_overflow<O: Overflow<T>>(&mut self, mut task: T, overflow: &O) {
        let tail = loop {
            let head = self.inner.head.load(Ordering::Acquire);
            let (steal, real) = unpack(head);

            // Safety: this is the only thread that updates the tail.
            let tail = unsafe { ptr::read(self.inner.tail.as_ptr()) };

            if tail.wrapping_sub(steal) < LOCAL_QUEUE_CAPACITY as u32 {
                break tail;
            } else if steal != real {
                // A steal is in progress and will free capacity; route this
                // one task through the global queue instead of waiting.
                overflow.push_batch(std::iter::once(task));
                return;
            } else {
                match self.push_overflow(task, real, tail, overflow) {
                    Ok(()) => return,
                    // Lost a race against a stealer; capacity may be back.
                    Err(t) => task = t,
                }
            }
        };

        let idx = tail as usize & MASK;
        // Safety: single producer, and the capacity check above guarantees
        // no live value occupies the slot.
        unsafe {
            ptr::write((*self.inner.buffer[idx].get()).as_mut_ptr(), task);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    /// Pushes a batch whose size the caller has already checked against
    /// `remaining_slots`.
    pub(crate) fn push_batch(&mut self, batch: impl ExactSizeIterator<Item = T>) {
        assert!(
            batch.len() <= self.remaining_slots(),
            "batch exceeds local queue capacity"
        );

        // Safety: this is the only thread that updates the tail.
        let mut tail = unsafe { ptr::read(self.inner.tail.as_ptr()) };
        for task in batch {
            let idx = tail as usize & MASK;
            // Safety: single producer, capacity checked above.
            unsafe {
                ptr::write((*self.inner.buffer[idx].get()).as_mut_ptr(), task);
            }
            tail = tail.wrapping_add(1);
        }
        self.inner.tail.store(tail, Ordering::Release);
    }

    /// Moves half of the ring plus `task` into the overflow queue as one
    /// batch. The claimed range is taken from the head, so stealers that
    /// raced for those tasks get another chance through the global queue.
    fn push_overflow<O: Overflow<T>>(
        &mut self,
        task: T,
        head: u32,
        tail: u32,
        overflow: &O,
    ) -> Result<(), T> {
        const TAKEN: u32 = (LOCAL_QUEUE_CAPACITY / 2) as u32;

        assert_eq!(
            tail.wrapping_sub(head) as usize,
            LOCAL_QUEUE_CAPACITY,
            "queue is not full; tail = {tail}; head = {head}"
        );

        let prev = pack(head, head);
        let next = pack(head.wrapping_add(TAKEN), head.wrapping_add(TAKEN));

        // Claim the range before reading it out; only the current thread
        // can push new tasks, so the claimed slots stay untouched.
        if self
            .inner
            .head
            .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(task);
        }

        struct BatchIter<'a, T> {
            buffer: &'a [UnsafeCell<MaybeUninit<T>>; LOCAL_QUEUE_CAPACITY],
            head: u32,
            i: u32,
        }

        impl<T> Iterator for BatchIter<'_, T> {
            type Item = T;

            fn next(&mut self) -> Option<T> {
                if self.i == TAKEN {
                    return None;
                }
                let idx = self.head.wrapping_add(self.i) as usize & MASK;
                // Safety: the head CAS above transferred ownership of this
                // range to us.
                let task = unsafe { ptr::read((*self.buffer[idx].get()).as_ptr()) };
                self.i += 1;
                Some(task)
            }
        }

        let batch = BatchIter {
            buffer: &self.inner.buffer,
            head,
            i: 0,
        };
        overflow.push_batch(batch.chain(std::iter::once(task)));

        Ok(())
    }
}

impl<T> Steal<T> {
    pub(crate) fn len(&self) -> usize {
        self.0.len() as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Steals roughly half of the victim's tasks into `dst` and returns one
    /// of them for immediate execution.
    pub(crate) fn steal_into(&self, dst: &mut Local<T>) -> Option<T> {
        // Safety: the caller owns `dst`.
        let dst_tail = unsafe { ptr::read(dst.inner.tail.as_ptr()) };

        // Abort if `dst` cannot absorb a half-capacity batch.
        let (steal, _) = unpack(dst.inner.head.load(Ordering::Acquire));
        if dst_tail.wrapping_sub(steal) > LOCAL_QUEUE_CAPACITY as u32 / 2 {
            return None;
        }

        let mut n = self.steal_chunk(dst, dst_tail);
        if n == 0 {
            return None;
        }

        // Keep one task for the caller.
        n -= 1;
        let ret_idx = dst_tail.wrapping_add(n) as usize & MASK;
        // Safety: written by `steal_chunk` and not yet visible to anyone.
        let ret = unsafe { ptr::read((*dst.inner.buffer[ret_idx].get()).as_ptr()) };

        if n > 0 {
            dst.inner
                .tail
                .store(dst_tail.wrapping_add(n), Ordering::Release);
        }

        Some(ret)
    }

    /// Claims up to half the victim's tasks and copies them into `dst`'s
    /// buffer without publishing them. Returns how many were taken.
    fn steal_chunk(&self, dst: &mut Local<T>, dst_tail: u32) -> u32 {
        let mut prev_packed = self.0.head.load(Ordering::SeqCst);
        let mut next_packed;

        let n = loop {
            let (src_steal, src_real) = unpack(prev_packed);
            let src_tail = self.0.tail.load(Ordering::SeqCst);

            if src_steal != src_real {
                // Another stealer holds the claim.
                return 0;
            }

            let size = src_tail.wrapping_sub(src_real);
            if size == 0 || size > LOCAL_QUEUE_CAPACITY as u32 {
                // Empty, or the owner is mid-pop and the indices are
                // momentarily inconsistent.
                return 0;
            }

            let n = size - size / 2;
            let steal_to = src_real.wrapping_add(n);
            next_packed = pack(src_real, steal_to);

            // Claim the tasks by advancing the real head while leaving the
            // steal half behind; other consumers stay out until we finish.
            match self.0.head.compare_exchange(
                prev_packed,
                next_packed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break n,
                Err(actual) => prev_packed = actual,
            }
        };

        let (first, _) = unpack(next_packed);
        for i in 0..n {
            let src_idx = first.wrapping_add(i) as usize & MASK;
            let dst_idx = dst_tail.wrapping_add(i) as usize & MASK;

            // Safety: the claim CAS above gave us this range; `dst` is owned
            // by the caller and has room (checked in `steal_into`).
            unsafe {
                let task = ptr::read((*self.0.buffer[src_idx].get()).as_ptr());
                ptr::write((*dst.inner.buffer[dst_idx].get()).as_mut_ptr(), task);
            }
        }

        // Release the claim: fold the steal index forward onto the real
        // head. The owner's single-task pop may have advanced the real head
        // in the meantime, hence the loop.
        let mut prev_packed = next_packed;
        loop {
            let (_, real) = unpack(prev_packed);
            next_packed = pack(real, real);

            match self.0.head.compare_exchange(
                prev_packed,
                next_packed,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return n,
                Err(actual) => prev_packed = actual,
            }
        }
    }
}

impl<T> Clone for Steal<T> {
    fn clone(&self) -> Self {
        Steal(self.0.clone())
    }
}

impl<T> std::fmt::Debug for Local<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Local").field("len", &self.len()).finish()
    }
}

impl<T> std::fmt::Debug for Steal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Steal").field("len", &self.len()).finish()
    }
}

impl<T> Drop for Local<T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            while self.pop().is_some() {}
        }
    }
}

impl<T> Inner<T> {
    fn len(&self) -> u32 {
        let (_, real) = unpack(self.head.load(Ordering::Acquire));
        let tail = self.tail.load(Ordering::Acquire);

        tail.wrapping_sub(real)
    }
}

/// Splits the packed head into (steal, real).
fn unpack(n: u64) -> (u32, u32) {
    let real = n & u32::MAX as u64;
    let steal = n >> 32;
    (steal as u32, real as u32)
}

fn pack(steal: u32, real: u32) -> u64 {
    (real as u64) | ((steal as u64) << 32)
}

/// Shared run queue fed by non-worker threads, overflow spills and the
/// periodic fairness poll. FIFO, unbounded, with a sticky closed flag.
pub(crate) struct GlobalQueue<T> {
    queue: Mutex<VecDeque<T>>,
    len: AtomicUsize,
    closed: AtomicBool,
}

impl<T> std::fmt::Debug for GlobalQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A single batch transfer never moves more than half a local queue, so the
/// puller keeps one task and the rest fit its ring.
pub(crate) const MAX_BATCH: usize = LOCAL_QUEUE_CAPACITY / 2;

impl<T> GlobalQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Pushes one task. Fails once the queue has been closed.
    pub(crate) fn push(&self, task: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(task);
        }
        queue.push_back(task);
        self.len.fetch_add(1, Ordering::Release);
        Ok(())
    }

    pub(crate) fn try_pop(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let mut queue = self.queue.lock();
        let task = queue.pop_front()?;
        self.len.fetch_sub(1, Ordering::Release);
        Some(task)
    }

    /// Pops up to `min(n, MAX_BATCH)` tasks in FIFO order.
    pub(crate) fn try_pop_batch(&self, n: usize) -> SmallVec<[T; 8]> {
        let n = n.min(MAX_BATCH);
        if n == 0 || self.is_empty() {
            return SmallVec::new();
        }

        let mut queue = self.queue.lock();
        let take = n.min(queue.len());
        let batch: SmallVec<[T; 8]> = queue.drain(..take).collect();
        self.len.fetch_sub(batch.len(), Ordering::Release);
        batch
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Sticky close. Tasks already queued can still be drained.
    pub(crate) fn close(&self) {
        let _queue = self.queue.lock();
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T> Overflow<T> for GlobalQueue<T> {
    fn push_batch(&self, batch: impl Iterator<Item = T>) {
        let mut queue = self.queue.lock();
        if self.closed.load(Ordering::Acquire) {
            // Shutdown is racing an overflow; the tasks are dropped, the
            // same as any task still queued when the runtime stops.
            drop(queue);
            for task in batch {
                drop(task);
            }
            return;
        }
        let before = queue.len();
        queue.extend(batch);
        self.len.fetch_add(queue.len() - before, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::thread;

    struct VecOverflow(Mutex<Vec<u64>>);

    impl VecOverflow {
        fn new() -> Self {
            VecOverflow(Mutex::new(Vec::new()))
        }
    }

    impl Overflow<u64> for VecOverflow {
        fn push_batch(&self, batch: impl Iterator<Item = u64>) {
            self.0.lock().extend(batch);
        }
    }

    #[test]
    fn test_push_pop_lifo() {
        let (_steal, mut local) = local::<u64>();
        let overflow = VecOverflow::new();

        for i in 0..4 {
            local.push_or_overflow(i, &overflow);
        }

        assert_eq!(local.len(), 4);
        assert_eq!(local.pop(), Some(3));
        assert_eq!(local.pop(), Some(2));
        assert_eq!(local.pop(), Some(1));
        assert_eq!(local.pop(), Some(0));
        assert_eq!(local.pop(), None);
        assert!(overflow.0.lock().is_empty());
    }

    #[test]
    fn test_overflow_spills_half_plus_one() {
        let (_steal, mut local) = local::<u64>();
        let overflow = VecOverflow::new();

        for i in 0..=LOCAL_QUEUE_CAPACITY as u64 {
            local.push_or_overflow(i, &overflow);
        }

        let spilled = overflow.0.lock();
        assert_eq!(spilled.len(), LOCAL_QUEUE_CAPACITY / 2 + 1);
        // The oldest half goes out first, then the task that overflowed.
        assert_eq!(spilled[0], 0);
        assert_eq!(*spilled.last().unwrap(), LOCAL_QUEUE_CAPACITY as u64);
        drop(spilled);

        assert_eq!(local.len(), LOCAL_QUEUE_CAPACITY / 2);
    }

    #[test]
    fn test_steal_takes_half_from_head() {
        let (steal, mut src) = local::<u64>();
        let (_dst_steal, mut dst) = local::<u64>();
        let overflow = VecOverflow::new();

        for i in 0..8 {
            src.push_or_overflow(i, &overflow);
        }

        let got = steal.steal_into(&mut dst).unwrap();
        // Half of 8 is claimed from the head; the last claimed task is
        // handed back for immediate execution.
        assert_eq!(got, 3);
        assert_eq!(dst.len(), 3);
        assert_eq!(src.len(), 4);

        // The stolen tasks keep their order in the destination ring.
        assert_eq!(dst.pop(), Some(2));
        assert_eq!(dst.pop(), Some(1));
        assert_eq!(dst.pop(), Some(0));
    }

    #[test]
    fn test_steal_from_empty() {
        let (steal, mut _local) = local::<u64>();
        let (_s, mut dst) = local::<u64>();
        assert!(steal.steal_into(&mut dst).is_none());
    }

    #[rstest]
    #[case::two_thieves(2, 512)]
    #[case::four_thieves(4, 2048)]
    fn test_concurrent_steal_keeps_every_task(#[case] thieves: usize, #[case] total: u64) {
        let (steal, mut local) = local::<u64>();
        let overflow = Arc::new(GlobalQueue::<u64>::new());
        let taken = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..thieves)
            .map(|_| {
                let steal = steal.clone();
                let taken = taken.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let (_s, mut dst) = super::local::<u64>();
                    let mut got = Vec::new();
                    while !done.load(Ordering::Acquire) || !steal.is_empty() {
                        if let Some(task) = steal.steal_into(&mut dst) {
                            got.push(task);
                            while let Some(t) = dst.pop() {
                                got.push(t);
                            }
                        }
                    }
                    taken.lock().extend(got);
                })
            })
            .collect();

        let mut popped = Vec::new();
        for i in 0..total {
            local.push_or_overflow(i, &*overflow);
            if i % 3 == 0 {
                if let Some(t) = local.pop() {
                    popped.push(t);
                }
            }
        }
        while let Some(t) = local.pop() {
            popped.push(t);
        }
        done.store(true, Ordering::Release);

        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<u64> = taken.lock().clone();
        all.extend(popped);
        while let Some(t) = overflow.try_pop() {
            all.push(t);
        }

        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len() as u64, total, "tasks lost or duplicated");
    }

    #[test]
    fn test_global_queue_close_is_sticky() {
        let global = GlobalQueue::new();
        global.push(1u64).unwrap();
        global.close();

        assert!(global.is_closed());
        assert_eq!(global.push(2), Err(2));
        // Remaining items drain after close.
        assert_eq!(global.try_pop(), Some(1));
        assert_eq!(global.try_pop(), None);
    }

    #[test]
    fn test_global_queue_batch_pop_is_capped() {
        let global = GlobalQueue::new();
        for i in 0..400u64 {
            global.push(i).unwrap();
        }

        let batch = global.try_pop_batch(400);
        assert_eq!(batch.len(), MAX_BATCH);
        assert_eq!(batch[0], 0);
        assert_eq!(global.len(), 400 - MAX_BATCH);
    }
}
