// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Schedulable units of work.
//!
//! The scheduler only knows how to call `run` on a shared task. A task
//! that wants to run again later (a fiber that yielded, or one that was
//! resumed after suspending) re-submits itself.

use std::sync::Arc;

/// A unit of work the worker pool can execute.
pub trait Task: Send + Sync + 'static {
    /// Run until the task completes, suspends, or yields.
    fn run(self: Arc<Self>);

    /// Label used in worker diagnostics.
    fn label(&self) -> &str {
        "task"
    }
}

/// Shared handle to a task. This is what queues store.
pub type TaskRef = Arc<dyn Task>;

#[cfg(test)]
pub(crate) use closure::FnTask;

#[cfg(test)]
mod closure {
    use std::fmt;
    use std::sync::{Arc, Mutex};

    use super::Task;

    /// One-shot closure task. Running it a second time is a no-op.
    pub(crate) struct FnTask {
        job: Mutex<Option<Box<dyn FnOnce() + Send>>>,
        label: &'static str,
    }

    impl FnTask {
        pub(crate) fn new(label: &'static str, job: impl FnOnce() + Send + 'static) -> Arc<Self> {
            Arc::new(Self {
                job: Mutex::new(Some(Box::new(job))),
                label,
            })
        }
    }

    impl Task for FnTask {
        fn run(self: Arc<Self>) {
            let job = self.job.lock().unwrap().take();
            if let Some(job) = job {
                job();
            }
        }

        fn label(&self) -> &str {
            self.label
        }
    }

    impl fmt::Debug for FnTask {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("FnTask").field("label", &self.label).finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fn_task_runs_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = FnTask::new("count", move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        task.clone().run();
        task.run();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
