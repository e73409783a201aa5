use crate::context;
use crate::task::Task;
use std::future::Future;

// Public API
mod builder;
pub use builder::Builder;
pub(crate) use builder::RuntimeConfig;

#[allow(clippy::module_inception)]
mod runtime;
pub use runtime::Runtime;

// Scheduler internals
pub(crate) mod blocking;
pub(crate) mod queue;
pub(crate) mod shared;
mod state;
mod ticker;
mod worker;

/// Spawns a fire-and-forget task from inside the runtime.
///
/// The task goes onto the current worker's local queue. When the caller is
/// itself tracked by a [`Runtime::block_on`] or [`Runtime::wait_all`], the
/// new task joins that tracking, so the blocked thread also waits for it.
///
/// Panics when called from a thread that is not a runtime worker; use
/// [`Runtime::spawn`] there instead.
#[track_caller]
pub fn spawn<F>(future: F)
where
    F: Future + Send + 'static,
{
    context::with_context(|ctx| {
        let tracker = context::current_tracker();
        if let Some(tracker) = &tracker {
            tracker.register_task();
        }

        let task = Task::new(
            async move {
                let _ = future.await;
            },
            ctx.shared.clone(),
            tracker,
        );
        ctx.push_task(task);
    })
}
