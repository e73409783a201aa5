use crate::context;
use crate::io::engine::IoEngine;
use crate::io::waker::EventWaker;
use crate::runtime::RuntimeConfig;
use crate::runtime::blocking::{BlockOnTracker, CatchUnwind, ResultSlot};
use crate::runtime::queue;
use crate::runtime::shared::{Shared, WorkerHandle};
use crate::runtime::worker::Worker;
use crate::task::Task;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Barrier};
use std::thread;

/// A running scheduler: worker threads, their rings, and the entry points
/// for submitting coroutines from outside.
///
/// Dropping the runtime stops it: the global queue closes, workers drain
/// and exit, and the drop returns once the last worker has been joined.
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<Shared>,
    join_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Builds with default configuration; see [`Builder`] for knobs.
    ///
    /// [`Builder`]: crate::Builder
    pub fn try_new() -> Result<Runtime> {
        crate::Builder::new().try_build()
    }

    pub(crate) fn try_new_with(config: RuntimeConfig) -> Result<Runtime> {
        let num_workers = config.num_workers;

        // Queues, wakers and engines are created up front on this thread so
        // setup errors surface here instead of inside a worker.
        let mut handles = Vec::with_capacity(num_workers);
        let mut locals = Vec::with_capacity(num_workers);
        let mut engines = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let (steal, local) = queue::local();
            let waker = Arc::new(EventWaker::new()?);
            engines.push(
                IoEngine::try_new(&config, waker.clone())
                    .with_context(|| format!("failed to set up the ring for worker {id}"))?,
            );
            locals.push(local);
            handles.push(WorkerHandle {
                id,
                steal,
                waker,
                is_searching: AtomicBool::new(false),
            });
        }

        let shared = Arc::new(Shared::new(config, handles));

        // All workers check in at the barrier before the constructor
        // returns; afterwards every submission path has a live consumer.
        let barrier = Arc::new(Barrier::new(num_workers + 1));
        let mut join_handles = Vec::with_capacity(num_workers);

        for (id, (local, engine)) in locals.into_iter().zip(engines).enumerate() {
            let shared = shared.clone();
            let barrier = barrier.clone();

            let handle = thread::Builder::new()
                .name(format!("riptide-worker-{id}"))
                .spawn(move || {
                    context::init_worker(shared.clone(), local, engine)
                        .expect("worker context double-initialized");
                    barrier.wait();
                    Worker::new(id, shared).run();
                })
                .context("failed to spawn worker thread")?;
            join_handles.push(handle);
        }

        barrier.wait();

        Ok(Runtime {
            shared,
            join_handles: Mutex::new(join_handles),
        })
    }

    /// Runs `future` to completion on the runtime and blocks the calling
    /// thread until it — and every task it transitively [`spawn`]ed —
    /// has finished. A panic inside `future` resurfaces here.
    ///
    /// [`spawn`]: crate::spawn
    #[track_caller]
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            !context::is_worker_thread(),
            "block_on called from inside the runtime; await the future instead"
        );

        let tracker = Arc::new(BlockOnTracker::new(1));
        let slot = Arc::new(ResultSlot::new());

        let shim = {
            let slot = slot.clone();
            async move {
                let result = CatchUnwind::new(future).await;
                slot.set(result);
            }
        };

        let task = Task::new(shim, self.shared.clone(), Some(tracker.clone()));
        assert!(self.shared.inject(task), "runtime has been stopped");

        tracker.wait_all_done();
        slot.take()
    }

    /// Submits `future` to run in the background. From a non-worker thread
    /// the task lands on the global queue; from inside a task this is the
    /// same as the free [`spawn`].
    ///
    /// [`spawn`]: crate::spawn
    pub fn spawn<F>(&self, future: F)
    where
        F: Future + Send + 'static,
    {
        if context::is_worker_thread() {
            crate::runtime::spawn(future);
            return;
        }
        let task = Task::new(
            async move {
                let _ = future.await;
            },
            self.shared.clone(),
            None,
        );
        let _accepted = self.shared.inject(task);
    }

    /// Runs a batch of coroutines concurrently, blocking until all of them
    /// (plus their transitive spawns) finish. Results come back in
    /// submission order. A panicking future re-raises its panic here after
    /// the batch has fully settled; the other results are lost with it.
    #[track_caller]
    pub fn wait_all<F, I>(&self, futures: I) -> Vec<F::Output>
    where
        I: IntoIterator<Item = F>,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            !context::is_worker_thread(),
            "wait_all called from inside the runtime"
        );

        let futures: Vec<F> = futures.into_iter().collect();
        if futures.is_empty() {
            return Vec::new();
        }

        let tracker = Arc::new(BlockOnTracker::new(futures.len()));
        let slots: Vec<Arc<ResultSlot<F::Output>>> = (0..futures.len())
            .map(|_| Arc::new(ResultSlot::new()))
            .collect();

        let tasks: Vec<Task> = futures
            .into_iter()
            .zip(&slots)
            .map(|(future, slot)| {
                let slot = slot.clone();
                let shim = async move {
                    let result = CatchUnwind::new(future).await;
                    slot.set(result);
                };
                Task::new(shim, self.shared.clone(), Some(tracker.clone()))
            })
            .collect();

        assert!(
            !self.shared.global.is_closed(),
            "runtime has been stopped"
        );
        self.shared.inject_batch(tasks.into_iter());

        tracker.wait_all_done();
        slots.iter().map(|slot| slot.take()).collect()
    }

    /// Stops the runtime: closes the global queue, wakes every worker and
    /// joins them. Idempotent.
    pub fn stop(&self) {
        self.shared.close();

        let handles: Vec<_> = self.join_handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
