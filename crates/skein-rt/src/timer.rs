// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer reactor: a deadline heap serviced by a dedicated thread.
//!
//! Fibers that sleep register a callback with a deadline; the timer
//! thread runs the callback once the deadline passes. Callbacks run on
//! the timer thread and must be short (resuming a fiber only queues it).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle for cancelling a registered deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

struct TimerState {
    /// Min-heap of (deadline, key). Cancelled keys stay until popped or
    /// pruned.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, Callback>,
    next_key: u64,
}

pub struct Timer {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Upper bound on a single wait so shutdown is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(50);

/// Stale heap entries tolerated beyond twice the live ones before a
/// cancel rebuilds the heap.
const PRUNE_SLACK: usize = 64;

impl Timer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TimerState {
                deadlines: BinaryHeap::new(),
                callbacks: HashMap::new(),
                next_key: 0,
            }),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Run `f` on the timer thread once `deadline` has passed.
    pub fn schedule(&self, deadline: Instant, f: impl FnOnce() + Send + 'static) -> TimerKey {
        let mut state = self.state.lock().unwrap();
        let key = state.next_key;
        state.next_key += 1;
        let earliest = state.deadlines.peek().map(|Reverse((d, _))| *d);
        state.deadlines.push(Reverse((deadline, key)));
        state.callbacks.insert(key, Box::new(f));
        drop(state);
        // Only a new earliest deadline changes how long the thread sleeps.
        if earliest.map_or(true, |d| deadline < d) {
            self.wakeup.notify_one();
        }
        TimerKey(key)
    }

    pub fn schedule_after(&self, delay: Duration, f: impl FnOnce() + Send + 'static) -> TimerKey {
        self.schedule(Instant::now() + delay, f)
    }

    /// Remove a pending callback. Returns false if it already fired or
    /// was cancelled.
    pub fn cancel(&self, key: TimerKey) -> bool {
        let mut state = self.state.lock().unwrap();
        let TimerState {
            deadlines, callbacks, ..
        } = &mut *state;
        let removed = callbacks.remove(&key.0).is_some();
        if deadlines.len() > 2 * callbacks.len() + PRUNE_SLACK {
            deadlines.retain(|Reverse((_, k))| callbacks.contains_key(k));
        }
        removed
    }

    /// Number of callbacks still waiting.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().callbacks.len()
    }

    /// Run every callback whose deadline is at or before `now`.
    /// Returns how many fired.
    pub fn fire_due(&self, now: Instant) -> usize {
        let due = {
            let mut state = self.state.lock().unwrap();
            let mut due = Vec::new();
            while let Some(Reverse((deadline, key))) = state.deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                state.deadlines.pop();
                if let Some(cb) = state.callbacks.remove(&key) {
                    due.push(cb);
                }
            }
            due
        };
        let fired = due.len();
        for cb in due {
            cb();
        }
        fired
    }

    /// Timer thread body.
    pub fn run_until_shutdown(&self) {
        while !self.should_shutdown() {
            self.fire_due(Instant::now());
            let state = self.state.lock().unwrap();
            let wait = match state.deadlines.peek() {
                Some(Reverse((deadline, _))) => {
                    deadline.saturating_duration_since(Instant::now()).min(MAX_WAIT)
                }
                None => MAX_WAIT,
            };
            if wait.is_zero() || self.should_shutdown() {
                continue;
            }
            let _ = self.wakeup.wait_timeout(state, wait).unwrap();
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wakeup.notify_all();
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};
    use std::thread;

    #[test]
    fn fires_in_deadline_order() {
        let timer = Timer::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let base = Instant::now();
        for (i, ms) in [(1, 30u64), (2, 10), (3, 20)] {
            let order = order.clone();
            timer.schedule(base + Duration::from_millis(ms), move || {
                order.lock().unwrap().push(i)
            });
        }
        assert_eq!(timer.fire_due(base + Duration::from_millis(15)), 1);
        assert_eq!(timer.fire_due(base + Duration::from_millis(40)), 2);
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn cancelled_callback_never_runs() {
        let timer = Timer::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let key = timer.schedule(Instant::now(), move || {
            h.fetch_add(1, Ordering::Relaxed);
        });
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert_eq!(timer.fire_due(Instant::now()), 0);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn cancelled_deadlines_do_not_pile_up() {
        let timer = Timer::new();
        let far = Instant::now() + Duration::from_secs(3600);
        let keep = timer.schedule(far, || {});
        for _ in 0..10_000 {
            let key = timer.schedule(far, || {});
            assert!(timer.cancel(key));
        }
        let heap = timer.state.lock().unwrap().deadlines.len();
        assert!(heap <= 2 + PRUNE_SLACK + 1, "heap kept {heap} entries");
        assert_eq!(timer.pending(), 1);
        assert!(timer.cancel(keep));
    }

    #[test]
    fn timer_thread_fires_and_stops() {
        let timer = Arc::new(Timer::new());
        let t = timer.clone();
        let handle = thread::spawn(move || t.run_until_shutdown());
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        timer.schedule_after(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(19));
        timer.request_shutdown();
        handle.join().unwrap();
    }
}
