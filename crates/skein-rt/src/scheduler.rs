// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Worker pool that runs fiber tasks.
//!
//! Every worker drains its own queue first, checks the injector on a
//! fixed tick so outside submissions are not starved, steals from a
//! random peer when idle and finally parks. A separate timer thread
//! fires deadlines registered through `timer()`.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::queue::{InjectorQueue, LocalQueue};
use crate::task::TaskRef;
use crate::timer::Timer;

/// Local tasks a worker runs before it looks at the injector.
const INJECTOR_TICK: u32 = 61;

/// Longest a parked worker sleeps before looking for work again. Peers
/// do not notify when they queue locally, so stealable work is found on
/// this beat.
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

thread_local! {
    /// Set on worker threads: the worker's index and its pool.
    static CURRENT: Cell<Option<(usize, *const Pool)>> = const { Cell::new(None) };
}

/// State shared by the workers and by anyone submitting tasks.
struct Pool {
    locals: Vec<LocalQueue>,
    injector: InjectorQueue,
    /// Tasks submitted and not yet started.
    pending: AtomicUsize,
    stopping: AtomicBool,
    idle: Idle,
}

/// Parking lot for workers with nothing to do.
struct Idle {
    /// Wake-ups handed out and not yet consumed, at most one per worker.
    permits: Mutex<usize>,
    limit: usize,
    cvar: Condvar,
}

impl Idle {
    fn notify_one(&self) {
        let mut permits = self.permits.lock().unwrap();
        if *permits < self.limit {
            *permits += 1;
        }
        self.cvar.notify_one();
    }

    fn notify_all(&self) {
        let mut permits = self.permits.lock().unwrap();
        *permits = usize::MAX / 2;
        self.cvar.notify_all();
    }

    fn park(&self) {
        let mut permits = self.permits.lock().unwrap();
        if *permits == 0 {
            permits = self.cvar.wait_timeout(permits, PARK_TIMEOUT).unwrap().0;
        }
        *permits = permits.saturating_sub(1);
    }
}

impl Pool {
    fn current_worker(&self) -> Option<usize> {
        let me = self as *const Pool;
        CURRENT.with(|c| match c.get() {
            Some((id, pool)) if pool == me => Some(id),
            _ => None,
        })
    }
}

/// The worker threads, the timer thread, and the queues between them.
///
/// Dropping the scheduler stops it. Queued tasks are dropped unrun.
pub struct Scheduler {
    pool: Arc<Pool>,
    timer: Arc<Timer>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Start `workers` worker threads plus the timer thread. Zero picks
    /// the available parallelism.
    pub fn new(workers: usize) -> Self {
        let workers = match workers {
            0 => thread::available_parallelism().map_or(4, |n| n.get()),
            n => n,
        };
        let pool = Arc::new(Pool {
            locals: (0..workers).map(|_| LocalQueue::new()).collect(),
            injector: InjectorQueue::new(),
            pending: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            idle: Idle {
                permits: Mutex::new(0),
                limit: workers,
                cvar: Condvar::new(),
            },
        });
        let timer = Arc::new(Timer::new());

        let mut threads = Vec::with_capacity(workers + 1);
        let ticking = timer.clone();
        threads.push(
            thread::Builder::new()
                .name("skein-timer".into())
                .spawn(move || ticking.run_until_shutdown())
                .expect("failed to spawn timer thread"),
        );
        for id in 0..workers {
            let pool = pool.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("skein-worker-{id}"))
                    .spawn(move || Worker::new(id, pool).run())
                    .expect("failed to spawn worker thread"),
            );
        }
        tracing::debug!(workers, "scheduler started");

        Self {
            pool,
            timer,
            threads: Mutex::new(threads),
        }
    }

    /// Queue `task`. Submissions from one of this pool's workers stay on
    /// that worker; everything else goes through the injector.
    pub fn schedule(&self, task: TaskRef) {
        let pool = &self.pool;
        pool.pending.fetch_add(1, Ordering::AcqRel);
        match pool.current_worker() {
            Some(id) => pool.locals[id].push(task, &pool.injector),
            None => pool.injector.push(task),
        }
        pool.idle.notify_one();
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn worker_count(&self) -> usize {
        self.pool.locals.len()
    }

    /// Tasks submitted and not yet started.
    pub fn pending(&self) -> usize {
        self.pool.pending.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.pool.stopping.load(Ordering::Acquire)
    }

    /// Stop the workers and the timer thread and join them. Suspended
    /// and queued tasks are abandoned. Calling it again, or from a
    /// worker, is fine; a worker never joins itself.
    pub fn shutdown(&self) {
        if self.pool.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.timer.request_shutdown();
        self.pool.idle.notify_all();

        let me = thread::current().id();
        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in threads {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
        for local in &self.pool.locals {
            drop(local.drain_all());
        }
        self.pool.injector.clear();
        tracing::debug!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    pool: Arc<Pool>,
    tick: u32,
    /// xorshift state for picking steal victims.
    seed: u64,
}

impl Worker {
    fn new(id: usize, pool: Arc<Pool>) -> Self {
        Self {
            id,
            pool,
            tick: 0,
            seed: (id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn run(mut self) {
        CURRENT.with(|c| c.set(Some((self.id, Arc::as_ptr(&self.pool)))));
        tracing::trace!(worker = self.id, "worker started");
        while !self.pool.stopping.load(Ordering::Acquire) {
            match self.next_task() {
                Some(task) => self.execute(task),
                None => self.pool.idle.park(),
            }
        }
        CURRENT.with(|c| c.set(None));
        tracing::trace!(worker = self.id, "worker stopped");
    }

    fn next_task(&mut self) -> Option<TaskRef> {
        let pool = &*self.pool;
        let local = &pool.locals[self.id];
        self.tick = self.tick.wrapping_add(1);
        if self.tick % INJECTOR_TICK == 0 {
            if let Some(task) = pool.injector.pop() {
                return Some(task);
            }
        }
        if let Some(task) = local.pop() {
            return Some(task);
        }
        if let Some(task) = pool.injector.pop_batch_into(local, pool.locals.len()) {
            return Some(task);
        }
        self.steal()
    }

    /// Try every peer once, starting from a random one.
    fn steal(&mut self) -> Option<TaskRef> {
        let workers = self.pool.locals.len();
        if workers < 2 {
            return None;
        }
        let start = self.next_random() as usize % workers;
        let local = &self.pool.locals[self.id];
        (0..workers)
            .map(|i| (start + i) % workers)
            .filter(|&victim| victim != self.id)
            .find_map(|victim| self.pool.locals[victim].steal_into(local))
    }

    fn next_random(&mut self) -> u64 {
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed = x;
        x
    }

    /// Run one task. A panic escaping it is logged and the worker goes on.
    fn execute(&self, task: TaskRef) {
        self.pool.pending.fetch_sub(1, Ordering::AcqRel);
        if panic::catch_unwind(AssertUnwindSafe(|| task.clone().run())).is_err() {
            tracing::error!(worker = self.id, task = task.label(), "task panicked on worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::FnTask;
    use std::time::Instant;

    fn wait_for(what: &str, pred: impl Fn() -> bool) {
        let start = Instant::now();
        while !pred() {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn counting(hits: &Arc<AtomicUsize>) -> TaskRef {
        let hits = hits.clone();
        FnTask::new("count", move || {
            hits.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn runs_submitted_tasks() {
        let sched = Scheduler::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            sched.schedule(counting(&hits));
        }
        wait_for("all tasks", || hits.load(Ordering::Relaxed) == 100);
        assert_eq!(sched.pending(), 0);
        sched.shutdown();
        assert!(sched.is_shutdown());
    }

    #[test]
    fn zero_workers_means_available_parallelism() {
        let sched = Scheduler::new(0);
        assert!(sched.worker_count() >= 1);
    }

    #[test]
    fn a_panic_does_not_kill_the_worker() {
        let sched = Scheduler::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        sched.schedule(FnTask::new("boom", || panic!("boom")));
        sched.schedule(counting(&hits));
        wait_for("the task after the panic", || hits.load(Ordering::Relaxed) == 1);
    }

    #[test]
    fn tasks_queued_by_a_worker_get_stolen() {
        let sched = Arc::new(Scheduler::new(4));
        let hits = Arc::new(AtomicUsize::new(0));
        let threads = Arc::new(Mutex::new(std::collections::HashSet::new()));
        let (s, h, t) = (sched.clone(), hits.clone(), threads.clone());
        sched.schedule(FnTask::new("fan-out", move || {
            for _ in 0..64 {
                let (h, t) = (h.clone(), t.clone());
                s.schedule(FnTask::new("leaf", move || {
                    t.lock().unwrap().insert(thread::current().id());
                    thread::sleep(Duration::from_millis(2));
                    h.fetch_add(1, Ordering::Relaxed);
                }));
            }
        }));
        wait_for("every leaf", || hits.load(Ordering::Relaxed) == 64);
        assert!(threads.lock().unwrap().len() > 1);
        sched.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sched = Scheduler::new(1);
        sched.shutdown();
        sched.shutdown();
        assert!(sched.is_shutdown());
    }
}
