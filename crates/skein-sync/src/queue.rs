// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Asynchronous queues.
//!
//! Takers park when the queue is empty. What an offer does on a full
//! queue depends on the [`Strategy`]: bounded queues park the offerer,
//! dropping queues reject the item and sliding queues evict the oldest.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex};

use skein_core::{Callback, Canceler, Cause, Concurrency, Data, Effect, FiberId};
use thiserror::Error;

/// What happens when an item arrives at a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The offerer waits for room.
    Bounded(usize),
    /// The new item is discarded and the offer reports `false`.
    Dropping(usize),
    /// The oldest item is discarded to make room.
    Sliding(usize),
    Unbounded,
}

impl Strategy {
    /// Capacity of a bounded strategy. Zero is treated as one.
    pub fn capacity(&self) -> Option<usize> {
        match *self {
            Strategy::Bounded(n) | Strategy::Dropping(n) | Strategy::Sliding(n) => Some(n.max(1)),
            Strategy::Unbounded => None,
        }
    }
}

/// Returned by the non-suspending operations once the queue is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue has been shut down")]
pub struct QueueShutdown;

struct Offerer<A> {
    id: u64,
    item: A,
    cb: Callback<bool, Infallible>,
}

struct State<A> {
    items: VecDeque<A>,
    takers: VecDeque<(u64, Callback<A, Infallible>)>,
    offerers: VecDeque<Offerer<A>>,
    next_id: u64,
    shutdown: Option<FiberId>,
    shutdown_waiters: Vec<(u64, Callback<(), Infallible>)>,
}

impl<A> State<A> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

enum Offered<A> {
    Done(bool),
    Full(A),
}

/// A FIFO queue shared between fibers.
pub struct Queue<A> {
    strategy: Strategy,
    state: Arc<Mutex<State<A>>>,
}

impl<A> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            strategy: self.strategy,
            state: self.state.clone(),
        }
    }
}

impl<A> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock().unwrap();
        f.debug_struct("Queue")
            .field("strategy", &self.strategy)
            .field("size", &st.items.len())
            .field("shutdown", &st.shutdown.is_some())
            .finish()
    }
}

impl<A: Data> Queue<A> {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            state: Arc::new(Mutex::new(State {
                items: VecDeque::new(),
                takers: VecDeque::new(),
                offerers: VecDeque::new(),
                next_id: 0,
                shutdown: None,
                shutdown_waiters: Vec::new(),
            })),
        }
    }

    /// A fresh queue each time the effect runs.
    pub fn make<E: Data>(strategy: Strategy) -> Effect<Queue<A>, E> {
        Effect::sync(move || Queue::new(strategy))
    }

    pub fn bounded<E: Data>(capacity: usize) -> Effect<Queue<A>, E> {
        Self::make(Strategy::Bounded(capacity))
    }

    pub fn dropping<E: Data>(capacity: usize) -> Effect<Queue<A>, E> {
        Self::make(Strategy::Dropping(capacity))
    }

    pub fn sliding<E: Data>(capacity: usize) -> Effect<Queue<A>, E> {
        Self::make(Strategy::Sliding(capacity))
    }

    pub fn unbounded<E: Data>() -> Effect<Queue<A>, E> {
        Self::make(Strategy::Unbounded)
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn capacity(&self) -> Option<usize> {
        self.strategy.capacity()
    }

    /// The write half of this queue.
    pub fn enqueue(&self) -> Enqueue<A> {
        Enqueue(self.clone())
    }

    /// The read half of this queue.
    pub fn dequeue(&self) -> Dequeue<A> {
        Dequeue(self.clone())
    }

    /// Hand the item to a waiting taker, or buffer it according to the
    /// strategy.
    fn offer_locked(&self, st: &mut State<A>, mut item: A) -> Offered<A> {
        while let Some((_, taker)) = st.takers.pop_front() {
            match taker.try_succeed(item) {
                Ok(()) => return Offered::Done(true),
                Err(back) => item = back,
            }
        }
        match self.capacity() {
            Some(cap) if st.items.len() >= cap => match self.strategy {
                Strategy::Dropping(_) => Offered::Done(false),
                Strategy::Sliding(_) => {
                    st.items.pop_front();
                    st.items.push_back(item);
                    Offered::Done(true)
                }
                _ => Offered::Full(item),
            },
            _ => {
                st.items.push_back(item);
                Offered::Done(true)
            }
        }
    }

    /// Pop the oldest item and let parked offerers fill the freed slot.
    fn take_locked(&self, st: &mut State<A>) -> Option<A> {
        let item = st.items.pop_front()?;
        let cap = self.capacity().unwrap_or(usize::MAX);
        while st.items.len() < cap {
            let Some(waiting) = st.offerers.pop_front() else {
                break;
            };
            if waiting.cb.try_succeed(true).is_ok() {
                st.items.push_back(waiting.item);
            }
        }
        Some(item)
    }

    /// Offer without suspending. A bounded queue that is full reports
    /// `false` here instead of waiting.
    pub fn offer_now(&self, item: A) -> Result<bool, QueueShutdown> {
        let mut st = self.state.lock().unwrap();
        if st.shutdown.is_some() {
            return Err(QueueShutdown);
        }
        match self.offer_locked(&mut st, item) {
            Offered::Done(accepted) => Ok(accepted),
            Offered::Full(_) => Ok(false),
        }
    }

    /// Add an item. Suspends on a full bounded queue; succeeds with
    /// whether the item was accepted.
    pub fn offer<E: Data>(&self, item: A) -> Effect<bool, E> {
        let this = self.clone();
        Effect::<bool, Infallible>::async_callback(move |cb| this.offer_or_wait(item.clone(), cb)).widen()
    }

    fn offer_or_wait(&self, item: A, cb: Callback<bool, Infallible>) -> Option<Canceler> {
        let mut st = self.state.lock().unwrap();
        if let Some(by) = st.shutdown {
            drop(st);
            cb.fail_cause(Cause::interrupt(by));
            return None;
        }
        match self.offer_locked(&mut st, item) {
            Offered::Done(accepted) => {
                drop(st);
                cb.succeed(accepted);
                None
            }
            Offered::Full(item) => {
                let id = st.next_id();
                st.offerers.push_back(Offerer { id, item, cb });
                let state = self.state.clone();
                Some(Box::new(move || {
                    state.lock().unwrap().offerers.retain(|o| o.id != id);
                }))
            }
        }
    }

    /// Offer every item in order. True if all of them were accepted.
    pub fn offer_all<E: Data>(&self, items: impl IntoIterator<Item = A>) -> Effect<bool, E> {
        Effect::<Vec<bool>, E>::for_each(items, |item| self.offer(item), Concurrency::Sequential)
            .map(|accepted| accepted.into_iter().all(|a| a))
    }

    /// Remove the oldest item, suspending while the queue is empty.
    pub fn take<E: Data>(&self) -> Effect<A, E> {
        let this = self.clone();
        Effect::<A, Infallible>::async_callback(move |cb| this.take_or_wait(cb)).widen()
    }

    fn take_or_wait(&self, cb: Callback<A, Infallible>) -> Option<Canceler> {
        let mut st = self.state.lock().unwrap();
        if let Some(by) = st.shutdown {
            drop(st);
            cb.fail_cause(Cause::interrupt(by));
            return None;
        }
        match self.take_locked(&mut st) {
            Some(item) => {
                drop(st);
                cb.succeed(item);
                None
            }
            None => {
                let id = st.next_id();
                st.takers.push_back((id, cb));
                let state = self.state.clone();
                Some(Box::new(move || {
                    state.lock().unwrap().takers.retain(|(t, _)| *t != id);
                }))
            }
        }
    }

    /// Remove the oldest item if there is one. Never suspends.
    pub fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        self.take_up_to(1).map(|mut items| items.pop())
    }

    /// Remove up to `max` items without suspending.
    pub fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        let this = self.clone();
        self.guarded(move |st| {
            let mut out = Vec::new();
            while out.len() < max {
                match this.take_locked(st) {
                    Some(item) => out.push(item),
                    None => break,
                }
            }
            out
        })
    }

    /// Remove everything currently buffered without suspending.
    pub fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        self.take_up_to(usize::MAX)
    }

    /// Number of buffered items.
    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        self.guarded(|st| st.items.len())
    }

    pub fn is_empty<E: Data>(&self) -> Effect<bool, E> {
        self.guarded(|st| st.items.is_empty())
    }

    pub fn is_full<E: Data>(&self) -> Effect<bool, E> {
        let cap = self.capacity();
        self.guarded(move |st| cap.is_some_and(|cap| st.items.len() >= cap))
    }

    /// Run `f` on the state, or interrupt when the queue is shut down.
    fn guarded<B: Data, E: Data>(&self, f: impl Fn(&mut State<A>) -> B + Send + Sync + 'static) -> Effect<B, E> {
        let state = self.state.clone();
        Effect::suspend(move || {
            let mut st = state.lock().unwrap();
            match st.shutdown {
                Some(by) => Effect::fail_cause(Cause::interrupt(by)),
                None => Effect::succeed(f(&mut st)),
            }
        })
    }

    /// Shut the queue down. Parked takers and offerers are interrupted,
    /// buffered items are discarded and every later operation is
    /// interrupted too.
    pub fn shutdown<E: Data>(&self) -> Effect<(), E> {
        let this = self.clone();
        Effect::<FiberId, E>::fiber_id().map(move |by| this.shutdown_as(by))
    }

    fn shutdown_as(&self, by: FiberId) {
        let (takers, offerers, waiters) = {
            let mut st = self.state.lock().unwrap();
            if st.shutdown.is_some() {
                return;
            }
            st.shutdown = Some(by);
            st.items.clear();
            (
                std::mem::take(&mut st.takers),
                std::mem::take(&mut st.offerers),
                std::mem::take(&mut st.shutdown_waiters),
            )
        };
        tracing::debug!(by = %by, takers = takers.len(), offerers = offerers.len(), "queue shut down");
        for (_, taker) in takers {
            taker.fail_cause(Cause::interrupt(by));
        }
        for offerer in offerers {
            offerer.cb.fail_cause(Cause::interrupt(by));
        }
        for (_, waiter) in waiters {
            waiter.succeed(());
        }
    }

    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        let state = self.state.clone();
        Effect::sync(move || state.lock().unwrap().shutdown.is_some())
    }

    /// Suspend until the queue is shut down.
    pub fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        let state = self.state.clone();
        Effect::<(), Infallible>::async_callback(move |cb| {
            let mut st = state.lock().unwrap();
            if st.shutdown.is_some() {
                drop(st);
                cb.succeed(());
                return None;
            }
            let id = st.next_id();
            st.shutdown_waiters.push((id, cb));
            let state = state.clone();
            Some(Box::new(move || {
                state.lock().unwrap().shutdown_waiters.retain(|(w, _)| *w != id);
            }) as Canceler)
        })
        .widen()
    }
}

/// The offering side of a [`Queue`].
pub struct Enqueue<A>(Queue<A>);

impl<A> Clone for Enqueue<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: Data> Enqueue<A> {
    pub fn offer<E: Data>(&self, item: A) -> Effect<bool, E> {
        self.0.offer(item)
    }

    pub fn offer_all<E: Data>(&self, items: impl IntoIterator<Item = A>) -> Effect<bool, E> {
        self.0.offer_all(items)
    }

    pub fn offer_now(&self, item: A) -> Result<bool, QueueShutdown> {
        self.0.offer_now(item)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.0.capacity()
    }

    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        self.0.size()
    }

    pub fn is_full<E: Data>(&self) -> Effect<bool, E> {
        self.0.is_full()
    }

    pub fn shutdown<E: Data>(&self) -> Effect<(), E> {
        self.0.shutdown()
    }

    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        self.0.is_shutdown()
    }

    pub fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        self.0.await_shutdown()
    }
}

/// The taking side of a [`Queue`].
pub struct Dequeue<A>(Queue<A>);

impl<A> Clone for Dequeue<A> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<A: Data> Dequeue<A> {
    pub fn take<E: Data>(&self) -> Effect<A, E> {
        self.0.take()
    }

    pub fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        self.0.poll()
    }

    pub fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        self.0.take_up_to(max)
    }

    pub fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        self.0.take_all()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.0.capacity()
    }

    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        self.0.size()
    }

    pub fn is_empty<E: Data>(&self) -> Effect<bool, E> {
        self.0.is_empty()
    }

    pub fn shutdown<E: Data>(&self) -> Effect<(), E> {
        self.0.shutdown()
    }

    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        self.0.is_shutdown()
    }

    pub fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        self.0.await_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{Runtime, RuntimeConfig};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::with_config(RuntimeConfig::default().workers(4))
    }

    fn pause() -> Effect<(), Infallible> {
        Effect::sleep(Duration::from_millis(30))
    }

    #[test]
    fn bounded_offer_waits_for_room() {
        let rt = runtime();
        let q: Queue<i32> = Queue::new(Strategy::Bounded(2));
        let eff: Effect<(usize, bool, i32, Vec<i32>), Infallible> = q.offer_all::<Infallible>([1, 2, 3]).fork().flat_map({
            let q = q.clone();
            move |producer| {
                let q2 = q.clone();
                pause()
                    .zip_right(&q.size())
                    .zip(&Effect::sync({
                        let producer = producer.clone();
                        move || producer.is_done()
                    }))
                    .zip(&q.take())
                    .flat_map(move |((size, done), first)| {
                        let q2 = q2.clone();
                        producer
                            .join()
                            .zip_right(&q2.take_all())
                            .map(move |rest| (size, done, first, rest))
                    })
            }
        });
        assert_eq!(rt.run_blocking(&eff), Ok((2, false, 1, vec![2, 3])));
    }

    #[test]
    fn sliding_keeps_the_newest() {
        let rt = Runtime::new();
        let q: Queue<i32> = Queue::new(Strategy::Sliding(2));
        let eff: Effect<(bool, Vec<i32>), Infallible> = q.offer_all([1, 2, 3]).zip(&q.take_all());
        assert_eq!(rt.run_sync(&eff), Ok((true, vec![2, 3])));
    }

    #[test]
    fn dropping_rejects_when_full() {
        let rt = Runtime::new();
        let q: Queue<i32> = Queue::new(Strategy::Dropping(2));
        let offers: Effect<Vec<bool>, Infallible> =
            Effect::for_each([1, 2, 3], |i| q.offer(i), Concurrency::Sequential);
        assert_eq!(rt.run_sync(&offers), Ok(vec![true, true, false]));
        assert_eq!(rt.run_sync(&q.take_all::<Infallible>()), Ok(vec![1, 2]));
    }

    #[test]
    fn take_waits_for_an_offer() {
        let rt = runtime();
        let q: Queue<&'static str> = Queue::new(Strategy::Unbounded);
        let eff: Effect<&'static str, Infallible> = q.take::<Infallible>().fork().flat_map({
            let q = q.clone();
            move |taker| pause().zip_right(&q.offer("hello")).zip_right(&taker.join())
        });
        assert_eq!(rt.run_blocking(&eff), Ok("hello"));
    }

    #[test]
    fn interrupted_taker_does_not_swallow_items() {
        let rt = runtime();
        let q: Queue<i32> = Queue::new(Strategy::Unbounded);
        let taker = rt.run_fork(&q.take::<Infallible>());
        std::thread::sleep(Duration::from_millis(20));
        let stop: Effect<_, Infallible> = taker.interrupt();
        assert!(rt.run_blocking(&stop).unwrap().is_interrupted());
        assert_eq!(q.offer_now(5), Ok(true));
        assert_eq!(rt.run_blocking(&q.poll::<Infallible>()), Ok(Some(5)));
    }

    #[test]
    fn interrupted_offerer_withdraws_its_item() {
        let rt = runtime();
        let q: Queue<i32> = Queue::new(Strategy::Bounded(1));
        assert_eq!(q.offer_now(1), Ok(true));
        let offerer = rt.run_fork(&q.offer::<Infallible>(2));
        std::thread::sleep(Duration::from_millis(20));
        let stop: Effect<_, Infallible> = offerer.interrupt();
        assert!(rt.run_blocking(&stop).unwrap().is_interrupted());
        assert_eq!(rt.run_blocking(&q.take_all::<Infallible>()), Ok(vec![1]));
    }

    #[test]
    fn shutdown_interrupts_waiters_and_later_calls() {
        let rt = runtime();
        let q: Queue<i32> = Queue::new(Strategy::Bounded(4));
        let taker = rt.run_fork(&q.take::<Infallible>());
        let watcher = rt.run_fork(&q.await_shutdown::<Infallible>());
        std::thread::sleep(Duration::from_millis(20));
        rt.run_blocking(&q.shutdown::<Infallible>()).unwrap();
        assert!(taker.await_blocking().is_interrupted());
        assert!(watcher.await_blocking().is_success());
        assert!(rt.run_blocking_exit(&q.offer::<Infallible>(1)).is_interrupted());
        assert_eq!(q.offer_now(1), Err(QueueShutdown));
        assert_eq!(rt.run_blocking(&q.is_shutdown::<Infallible>()), Ok(true));
    }

    #[test]
    fn halves_share_one_buffer() {
        let rt = Runtime::new();
        let q: Queue<char> = Queue::new(Strategy::Bounded(3));
        let (tx, rx) = (q.enqueue(), q.dequeue());
        let eff: Effect<Vec<char>, Infallible> = tx.offer_all(['a', 'b']).zip_right(&rx.take_up_to(5));
        assert_eq!(rt.run_sync(&eff), Ok(vec!['a', 'b']));
        assert_eq!(tx.capacity(), Some(3));
    }
}
