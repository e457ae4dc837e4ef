// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run queues for fiber tasks.
//!
//! Each worker owns a `LocalQueue`; everything submitted from outside a
//! worker, and whatever spills out of a full local queue, goes through
//! the shared `InjectorQueue`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::task::TaskRef;

/// Tasks a local queue holds before it spills into the injector.
pub(crate) const LOCAL_CAPACITY: usize = 256;

/// Most tasks a worker pulls from the injector at once.
pub(crate) const INJECTOR_BATCH: usize = 32;

/// One worker's queue. The owner takes from the front; thieves take the
/// back half, so the owner keeps the tasks it queued most recently.
pub(crate) struct LocalQueue {
    tasks: Mutex<VecDeque<TaskRef>>,
    len: AtomicUsize,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::with_capacity(LOCAL_CAPACITY)),
            len: AtomicUsize::new(0),
        }
    }

    /// Queue `task`. When the queue is full, the older half moves to
    /// `overflow` together with `task` so the injector keeps FIFO order.
    pub fn push(&self, task: TaskRef, overflow: &InjectorQueue) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.len() < LOCAL_CAPACITY {
            tasks.push_back(task);
            self.len.store(tasks.len(), Ordering::Release);
            return;
        }
        let spilled: Vec<TaskRef> = tasks.drain(..LOCAL_CAPACITY / 2).collect();
        tasks.push_back(task);
        self.len.store(tasks.len(), Ordering::Release);
        drop(tasks);
        overflow.push_batch(spilled);
    }

    pub fn pop(&self) -> Option<TaskRef> {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.pop_front();
        self.len.store(tasks.len(), Ordering::Release);
        task
    }

    /// Move the back half of this queue into `dest` and hand back one
    /// of the moved tasks to run right away.
    pub fn steal_into(&self, dest: &LocalQueue) -> Option<TaskRef> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let mut stolen = {
            let mut tasks = self.tasks.lock().unwrap();
            let keep = tasks.len() / 2;
            let stolen = tasks.split_off(keep);
            self.len.store(tasks.len(), Ordering::Release);
            stolen
        };
        let first = stolen.pop_front()?;
        let mut mine = dest.tasks.lock().unwrap();
        mine.extend(stolen);
        dest.len.store(mine.len(), Ordering::Release);
        Some(first)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain_all(&self) -> Vec<TaskRef> {
        let mut tasks = self.tasks.lock().unwrap();
        self.len.store(0, Ordering::Release);
        tasks.drain(..).collect()
    }
}

/// Shared FIFO of tasks no particular worker owns.
pub(crate) struct InjectorQueue {
    tasks: Mutex<VecDeque<TaskRef>>,
    len: AtomicUsize,
}

impl InjectorQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, task: TaskRef) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push_back(task);
        self.len.store(tasks.len(), Ordering::Release);
    }

    pub fn push_batch(&self, batch: impl IntoIterator<Item = TaskRef>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.extend(batch);
        self.len.store(tasks.len(), Ordering::Release);
    }

    pub fn pop(&self) -> Option<TaskRef> {
        if self.is_empty() {
            return None;
        }
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.pop_front();
        self.len.store(tasks.len(), Ordering::Release);
        task
    }

    /// Take one task to run plus a fair share of the rest for `dest`,
    /// at most `INJECTOR_BATCH` in total.
    pub fn pop_batch_into(&self, dest: &LocalQueue, workers: usize) -> Option<TaskRef> {
        if self.is_empty() {
            return None;
        }
        let mut tasks = self.tasks.lock().unwrap();
        let share = (tasks.len() / workers.max(1)).clamp(1, INJECTOR_BATCH);
        let first = tasks.pop_front()?;
        let remaining = tasks.len();
        let rest: Vec<TaskRef> = tasks.drain(..(share - 1).min(remaining)).collect();
        self.len.store(tasks.len(), Ordering::Release);
        drop(tasks);
        for task in rest {
            dest.push(task, self);
        }
        Some(first)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.clear();
        self.len.store(0, Ordering::Release);
    }
}
