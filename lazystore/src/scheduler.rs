use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub type Task = BoxFuture<'static, ()>;

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const FINISHED: u8 = 3;

/// Shared state of a submitted task. Cancelling only wins while the task has
/// not started.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    state: Arc<AtomicU8>,
}

impl Default for TaskHandle {
    fn default() -> Self {
        TaskHandle { state: Arc::new(AtomicU8::new(PENDING)) }
    }
}

impl TaskHandle {
    pub fn new() -> Self {
        TaskHandle::default()
    }

    /// Handle for work that is already executing on the caller's side.
    pub fn running() -> Self {
        TaskHandle { state: Arc::new(AtomicU8::new(RUNNING)) }
    }

    pub fn cancel(&self) -> bool {
        self.state.compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) == FINISHED
    }

    /// True if both handles track the same task.
    pub fn is_same(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Wraps `task` so it runs only if it was not cancelled first.
    pub fn guard(&self, task: Task) -> Task {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            if state.compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                task.await;
                state.store(FINISHED, Ordering::Release);
            }
        })
    }
}

/// The host's worker pool. Storage calls of the cache only ever run inside
/// tasks submitted here.
///
/// `run_async` must hand the task to another task or thread and return before
/// it is polled. The cache dispatches loads while holding the entry lock of
/// the key, so a scheduler that runs tasks inline deadlocks on completion.
pub trait Scheduler: Send + Sync + 'static {
    fn run_async(&self, task: Task) -> TaskHandle;

    /// Runs `task` after `ticks` scheduler ticks.
    fn run_async_with_delay(&self, task: Task, ticks: u32) -> TaskHandle;

    fn tick(&self) -> Duration {
        TokioScheduler::DEFAULT_TICK
    }
}

/// [`Scheduler`] on a tokio runtime with a fixed tick length.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    tick: Duration,
}

impl TokioScheduler {
    pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

    pub fn new(handle: Handle, tick: Duration) -> Self {
        TokioScheduler { handle, tick }
    }

    /// Scheduler on the runtime of the calling task. Panics outside a runtime.
    pub fn current(tick: Duration) -> Self {
        TokioScheduler::new(Handle::current(), tick)
    }
}

impl Scheduler for TokioScheduler {
    fn tick(&self) -> Duration {
        self.tick
    }

    fn run_async(&self, task: Task) -> TaskHandle {
        let handle = TaskHandle::new();
        self.handle.spawn(handle.guard(task));
        handle
    }

    fn run_async_with_delay(&self, task: Task, ticks: u32) -> TaskHandle {
        let handle = TaskHandle::new();
        let delay = self.tick * ticks;
        let guarded = handle.guard(task);
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            guarded.await;
        });
        handle
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts submissions before handing them to a [`TokioScheduler`].
    pub(crate) struct CountingScheduler {
        inner: TokioScheduler,
        pub(crate) immediate: AtomicUsize,
        pub(crate) delayed: AtomicUsize,
    }

    impl CountingScheduler {
        pub(crate) fn new(tick: Duration) -> Self {
            CountingScheduler { inner: TokioScheduler::current(tick), immediate: AtomicUsize::new(0), delayed: AtomicUsize::new(0) }
        }

        pub(crate) fn delayed_count(&self) -> usize {
            self.delayed.load(Ordering::SeqCst)
        }
    }

    impl Scheduler for CountingScheduler {
        fn run_async(&self, task: Task) -> TaskHandle {
            self.immediate.fetch_add(1, Ordering::SeqCst);
            self.inner.run_async(task)
        }

        fn run_async_with_delay(&self, task: Task, ticks: u32) -> TaskHandle {
            self.delayed.fetch_add(1, Ordering::SeqCst);
            self.inner.run_async_with_delay(task, ticks)
        }

        fn tick(&self) -> Duration {
            self.inner.tick()
        }
    }
}
