//! Bounded multi-producer multi-consumer channel.
//!
//! All hand-off decisions happen under one short internal mutex. A send
//! with a parked receiver moves the value straight across; otherwise it
//! buffers or, when the ring is full, parks the sender carrying the value.
//! Receivers drain the buffer in FIFO order, refilling it from the eldest
//! parked sender so item order is preserved, and fall back to a direct
//! hand-off only on a zero-capacity rendezvous.
//!
//! Dropping the last endpoint of either kind closes the channel: parked
//! senders get their value back in the error, parked receivers observe the
//! close, and buffered items remain receivable until drained.
//!
//! Dropping a send or recv future while it is parked unlinks its waiter,
//! so no item is lost to a cancelled operation: an abandoned send keeps
//! its value out of the channel, and a value already handed to a
//! cancelled recv goes back to the head of the buffer.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, Waker};

/// Creates a bounded channel. `cap = 0` gives rendezvous semantics: every
/// send waits for a matching recv.
pub fn bounded<T: Send>(cap: usize) -> (Sender<T>, Receiver<T>) {
    let channel = Arc::new(Channel {
        inner: Mutex::new(Inner {
            buffer: VecDeque::with_capacity(cap),
            cap,
            waiting_senders: VecDeque::new(),
            waiting_receivers: VecDeque::new(),
            closed: false,
        }),
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });

    (
        Sender {
            channel: channel.clone(),
        },
        Receiver { channel },
    )
}

/// The sending half. Cloneable; the channel closes when the last sender or
/// the last receiver drops.
pub struct Sender<T> {
    channel: Arc<Channel<T>>,
}

/// The receiving half. Cloneable.
pub struct Receiver<T> {
    channel: Arc<Channel<T>>,
}

/// The channel is closed; the value comes back to the caller.
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel closed")
    }
}

impl<T> std::error::Error for SendError<T> {}

/// The channel is closed and the buffer has been drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("channel closed and drained")]
pub struct RecvError;

struct Channel<T> {
    inner: Mutex<Inner<T>>,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

struct Inner<T> {
    buffer: VecDeque<T>,
    cap: usize,
    waiting_senders: VecDeque<Arc<SendWaiter<T>>>,
    waiting_receivers: VecDeque<Arc<RecvWaiter<T>>>,
    closed: bool,
}

struct SendWaiter<T> {
    state: Mutex<SendWaiterState<T>>,
}

struct SendWaiterState<T> {
    /// The parked value. Taken by the receiver that completes us, or left
    /// in place on close so the error can return it.
    value: Option<T>,
    done: Option<Result<(), ()>>,
    waker: Option<Waker>,
}

struct RecvWaiter<T> {
    state: Mutex<RecvWaiterState<T>>,
}

struct RecvWaiterState<T> {
    done: Option<Result<T, ()>>,
    waker: Option<Waker>,
}

impl<T> Channel<T> {
    /// Wakes every parked endpoint with the closed verdict. Buffered items
    /// stay for later receives.
    fn close(&self) {
        let (senders, receivers) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.waiting_senders),
                std::mem::take(&mut inner.waiting_receivers),
            )
        };

        for sender in senders {
            let waker = {
                let mut state = sender.state.lock();
                state.done = Some(Err(()));
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
        for receiver in receivers {
            let waker = {
                let mut state = receiver.state.lock();
                state.done = Some(Err(()));
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

impl<T: Send> Sender<T> {
    /// Sends one value, suspending while the buffer is full and the
    /// channel open. Returns the value inside the error when the channel
    /// is closed.
    pub fn send(&self, value: T) -> SendFuture<'_, T> {
        SendFuture {
            channel: &self.channel,
            value: Some(value),
            waiter: None,
        }
    }
}

impl<T: Send> Receiver<T> {
    /// Receives one value in FIFO order, suspending while the channel is
    /// empty and open.
    pub fn recv(&self) -> RecvFuture<'_, T> {
        RecvFuture {
            channel: &self.channel,
            waiter: None,
        }
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.channel.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.channel.receivers.fetch_add(1, Ordering::Relaxed);
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.channel.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.channel.close();
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.channel.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.channel.close();
        }
    }
}

/// Future returned by [`Sender::send`].
#[must_use = "sends do nothing unless awaited"]
pub struct SendFuture<'a, T> {
    channel: &'a Arc<Channel<T>>,
    value: Option<T>,
    waiter: Option<Arc<SendWaiter<T>>>,
}

impl<T> Unpin for SendFuture<'_, T> {}

impl<T: Send> Future for SendFuture<'_, T> {
    type Output = Result<(), SendError<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            let result = {
                let mut state = waiter.state.lock();
                match state.done {
                    Some(Ok(())) => Poll::Ready(Ok(())),
                    Some(Err(())) => {
                        let value = state.value.take().expect("closed sender lost its value");
                        Poll::Ready(Err(SendError(value)))
                    }
                    None => {
                        state.waker = Some(cx.waker().clone());
                        Poll::Pending
                    }
                }
            };
            if result.is_ready() {
                this.waiter = None;
            }
            return result;
        }

        let value = this.value.take().expect("send polled after completion");
        let mut inner = this.channel.inner.lock();

        if inner.closed {
            return Poll::Ready(Err(SendError(value)));
        }

        // A parked receiver implies an empty buffer: hand the value over
        // directly and resume it. The waiter completes under the channel
        // lock, so a receive future cancelled right now either unlinked
        // itself already or will find the value and requeue it.
        if let Some(receiver) = inner.waiting_receivers.pop_front() {
            let waker = {
                let mut state = receiver.state.lock();
                state.done = Some(Ok(value));
                state.waker.take()
            };
            drop(inner);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(()));
        }

        if inner.buffer.len() < inner.cap {
            inner.buffer.push_back(value);
            return Poll::Ready(Ok(()));
        }

        // Full and open: park with the value in hand.
        let waiter = Arc::new(SendWaiter {
            state: Mutex::new(SendWaiterState {
                value: Some(value),
                done: None,
                waker: Some(cx.waker().clone()),
            }),
        });
        inner.waiting_senders.push_back(waiter.clone());
        drop(inner);

        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for SendFuture<'_, T> {
    fn drop(&mut self) {
        // A send cancelled while parked must not leave its value behind
        // for the backfill path to deliver.
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        let mut inner = self.channel.inner.lock();
        if let Some(pos) = inner
            .waiting_senders
            .iter()
            .position(|w| Arc::ptr_eq(w, &waiter))
        {
            inner.waiting_senders.remove(pos);
        }
        // Not linked anymore: a receiver already took the value (the send
        // happened) or the close path parked it in the waiter, where it is
        // dropped with it.
    }
}

/// Future returned by [`Receiver::recv`].
#[must_use = "receives do nothing unless awaited"]
pub struct RecvFuture<'a, T> {
    channel: &'a Arc<Channel<T>>,
    waiter: Option<Arc<RecvWaiter<T>>>,
}

impl<T: Send> Future for RecvFuture<'_, T> {
    type Output = Result<T, RecvError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            let result = {
                let mut state = waiter.state.lock();
                match state.done.take() {
                    Some(Ok(value)) => Poll::Ready(Ok(value)),
                    Some(Err(())) => Poll::Ready(Err(RecvError)),
                    None => {
                        state.waker = Some(cx.waker().clone());
                        Poll::Pending
                    }
                }
            };
            if result.is_ready() {
                this.waiter = None;
            }
            return result;
        }

        let mut inner = this.channel.inner.lock();

        if let Some(value) = inner.buffer.pop_front() {
            // Backfill the freed slot from the eldest parked sender; going
            // through the buffer keeps items FIFO.
            if let Some(sender) = inner.waiting_senders.pop_front() {
                let waker = {
                    let mut state = sender.state.lock();
                    let parked = state.value.take().expect("parked sender without a value");
                    inner.buffer.push_back(parked);
                    state.done = Some(Ok(()));
                    state.waker.take()
                };
                drop(inner);
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            return Poll::Ready(Ok(value));
        }

        // Empty buffer with a parked sender only happens at cap = 0:
        // rendezvous hand-off.
        if let Some(sender) = inner.waiting_senders.pop_front() {
            drop(inner);
            let (value, waker) = {
                let mut state = sender.state.lock();
                let value = state.value.take().expect("parked sender without a value");
                state.done = Some(Ok(()));
                (value, state.waker.take())
            };
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(value));
        }

        if inner.closed {
            return Poll::Ready(Err(RecvError));
        }

        let waiter = Arc::new(RecvWaiter {
            state: Mutex::new(RecvWaiterState {
                done: None,
                waker: Some(cx.waker().clone()),
            }),
        });
        inner.waiting_receivers.push_back(waiter.clone());
        drop(inner);

        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl<T> Drop for RecvFuture<'_, T> {
    fn drop(&mut self) {
        // A recv cancelled while parked must not leave its waiter in the
        // queue, where the next send would strand its value.
        let Some(waiter) = self.waiter.take() else {
            return;
        };

        let mut inner = self.channel.inner.lock();
        if let Some(pos) = inner
            .waiting_receivers
            .iter()
            .position(|w| Arc::ptr_eq(w, &waiter))
        {
            inner.waiting_receivers.remove(pos);
            return;
        }

        // Already unlinked: a sender handed a value to this waiter between
        // the last poll and now. Requeue it at the head so the next recv
        // observes it first.
        let mut state = waiter.state.lock();
        if let Some(Ok(value)) = state.done.take() {
            inner.buffer.push_front(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::Wake;

    struct CountingWake(AtomicUsize);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Waker, Arc<CountingWake>) {
        let inner = Arc::new(CountingWake(AtomicUsize::new(0)));
        (Waker::from(inner.clone()), inner)
    }

    #[test]
    fn test_buffered_send_recv() {
        let (tx, rx) = bounded::<u32>(4);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(
            pin!(tx.send(52)).poll(&mut cx),
            Poll::Ready(Ok(()))
        ));
        assert!(matches!(
            pin!(rx.recv()).poll(&mut cx),
            Poll::Ready(Ok(52))
        ));
    }

    #[test]
    fn test_full_buffer_parks_sender_fifo() {
        let (tx, rx) = bounded::<u32>(1);
        let (waker, woken) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(pin!(tx.send(1)).poll(&mut cx), Poll::Ready(Ok(()))));

        let mut parked = pin!(tx.send(2));
        assert!(parked.as_mut().poll(&mut cx).is_pending());

        // Recv takes the buffered item and backfills from the parked
        // sender, preserving order.
        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(1))));
        assert_eq!(woken.0.load(Ordering::SeqCst), 1);
        assert!(matches!(parked.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));

        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(2))));
    }

    #[test]
    fn test_rendezvous_hand_off() {
        let (tx, rx) = bounded::<u32>(0);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut send = pin!(tx.send(7));
        assert!(send.as_mut().poll(&mut cx).is_pending());

        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(7))));
        assert!(matches!(send.as_mut().poll(&mut cx), Poll::Ready(Ok(()))));
    }

    #[test]
    fn test_close_returns_value_to_parked_sender() {
        let (tx, rx) = bounded::<u32>(1);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(pin!(tx.send(1)).poll(&mut cx), Poll::Ready(Ok(()))));
        let mut parked = pin!(tx.send(2));
        assert!(parked.as_mut().poll(&mut cx).is_pending());

        drop(rx);

        match parked.as_mut().poll(&mut cx) {
            Poll::Ready(Err(SendError(v))) => assert_eq!(v, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_recv_drains_buffer_after_close() {
        let (tx, rx) = bounded::<u32>(4);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(pin!(tx.send(1)).poll(&mut cx), Poll::Ready(Ok(()))));
        assert!(matches!(pin!(tx.send(2)).poll(&mut cx), Poll::Ready(Ok(()))));
        drop(tx);

        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(1))));
        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(2))));
        assert!(matches!(
            pin!(rx.recv()).poll(&mut cx),
            Poll::Ready(Err(RecvError))
        ));
    }

    #[test]
    fn test_parked_receiver_woken_by_send() {
        let (tx, rx) = bounded::<u32>(4);
        let (waker, woken) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        let mut recv = pin!(rx.recv());
        assert!(recv.as_mut().poll(&mut cx).is_pending());

        assert!(matches!(pin!(tx.send(9)).poll(&mut cx), Poll::Ready(Ok(()))));
        assert_eq!(woken.0.load(Ordering::SeqCst), 1);
        assert!(matches!(recv.as_mut().poll(&mut cx), Poll::Ready(Ok(9))));
    }

    #[test]
    fn test_dropped_parked_recv_unlinks_waiter() {
        let (tx, rx) = bounded::<u32>(4);
        let (waker, woken) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        {
            let mut recv = pin!(rx.recv());
            assert!(recv.as_mut().poll(&mut cx).is_pending());
            // Cancelled while parked: the waiter must leave the queue.
        }

        // The send buffers instead of handing off to the dead waiter, so
        // nothing is lost and nobody stale is woken.
        assert!(matches!(pin!(tx.send(7)).poll(&mut cx), Poll::Ready(Ok(()))));
        assert_eq!(woken.0.load(Ordering::SeqCst), 0);
        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(7))));
    }

    #[test]
    fn test_dropped_recv_requeues_handed_off_value() {
        let (tx, rx) = bounded::<u32>(4);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        {
            let mut recv = pin!(rx.recv());
            assert!(recv.as_mut().poll(&mut cx).is_pending());

            // The hand-off lands in the parked waiter...
            assert!(matches!(pin!(tx.send(9)).poll(&mut cx), Poll::Ready(Ok(()))));
            // ...which is dropped before ever observing it.
        }

        // The value went back to the buffer head instead of dying with
        // the waiter.
        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(9))));
    }

    #[test]
    fn test_dropped_parked_send_reclaims_value() {
        let (tx, rx) = bounded::<u32>(1);
        let (waker, _) = counting_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(pin!(tx.send(1)).poll(&mut cx), Poll::Ready(Ok(()))));
        {
            let mut parked = pin!(tx.send(2));
            assert!(parked.as_mut().poll(&mut cx).is_pending());
            // Cancelled while parked: value 2 leaves with the future.
        }

        // Recv drains the buffer without backfilling the abandoned value.
        assert!(matches!(pin!(rx.recv()).poll(&mut cx), Poll::Ready(Ok(1))));
        assert!(pin!(rx.recv()).poll(&mut cx).is_pending());
    }
}
