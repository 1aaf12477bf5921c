//! Execution Contexts
//!
//! An [`ExecutionContext`] is the place a unit of work gets scheduled when an
//! effect asks to continue elsewhere (`Io::continue_on`). The run loop never
//! creates threads itself; it only hands tasks to a context.
//!
//! Two contexts ship with the crate:
//!
//! - [`Immediate`]: runs the task inline on the calling thread.
//! - [`ThreadPerTask`]: runs each task on a freshly spawned, named thread.
//!
//! Anything else (pools, event loops, UI threads) plugs in by implementing the
//! trait or wrapping a closure with [`from_fn`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

/// A unit of work handed to a context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A shared execution context, as stored inside effects.
pub type SharedContext = Arc<dyn ExecutionContext>;

/// Somewhere work can be scheduled.
pub trait ExecutionContext: Send + Sync {
    /// Schedule `task` to run on this context.
    ///
    /// Implementations must run the task exactly once, eventually.
    fn execute(&self, task: Task);

    /// Short name used in log events.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Runs every task inline, on the thread that scheduled it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl ExecutionContext for Immediate {
    fn execute(&self, task: Task) {
        task()
    }

    fn name(&self) -> &str {
        "immediate"
    }
}

/// Runs each task on a new OS thread.
pub struct ThreadPerTask {
    /// Thread name prefix.
    prefix: String,
    /// Number of threads spawned so far.
    spawned: AtomicU64,
}

impl ThreadPerTask {
    /// Create a context whose threads are named `<prefix>-<n>`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            spawned: AtomicU64::new(0),
        }
    }

    /// Create a context using the configured thread name prefix.
    pub fn from_config() -> Self {
        Self::new(crate::config::current().thread_name_prefix.clone())
    }

    /// Number of threads spawned so far.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ThreadPerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPerTask")
            .field("prefix", &self.prefix)
            .field("spawned", &self.spawned())
            .finish()
    }
}

impl ExecutionContext for ThreadPerTask {
    fn execute(&self, task: Task) {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Mutex::new(Some(task)));
        let thread_slot = slot.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.prefix, n))
            .spawn(move || {
                if let Some(task) = thread_slot.lock().take() {
                    task();
                }
            });

        if let Err(err) = spawned {
            // The task still has to run exactly once.
            tracing::error!(error = %err, context = %self.prefix, "thread spawn failed, running task inline");
            if let Some(task) = slot.lock().take() {
                task();
            }
        }
    }

    fn name(&self) -> &str {
        &self.prefix
    }
}

/// Context backed by a closure; see [`from_fn`].
pub struct FnContext<F> {
    name: String,
    schedule: F,
}

impl<F> ExecutionContext for FnContext<F>
where
    F: Fn(Task) + Send + Sync,
{
    fn execute(&self, task: Task) {
        (self.schedule)(task)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build a context from a scheduling closure.
pub fn from_fn<F>(name: impl Into<String>, schedule: F) -> FnContext<F>
where
    F: Fn(Task) + Send + Sync,
{
    FnContext {
        name: name.into(),
        schedule,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_immediate_runs_inline() {
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let ran_on_clone = ran_on.clone();

        Immediate.execute(Box::new(move || {
            *ran_on_clone.lock() = Some(thread::current().id());
        }));

        assert_eq!(*ran_on.lock(), Some(caller));
    }

    #[test]
    fn test_thread_per_task_names_threads() {
        let ctx = ThreadPerTask::new("hop");
        let (tx, rx) = crossbeam_channel::bounded(1);

        ctx.execute(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        }));

        let name = rx.recv().expect("task should run");
        assert_eq!(name.as_deref(), Some("hop-0"));
        assert_eq!(ctx.spawned(), 1);
    }

    #[test]
    fn test_from_fn_context() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let ctx = from_fn("counting", move |task: Task| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            task();
        });

        let hit = Arc::new(AtomicUsize::new(0));
        let hit_clone = hit.clone();
        ctx.execute(Box::new(move || {
            hit_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(ctx.name(), "counting");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
