// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Broadcast hub.
//!
//! Every subscription gets its own backlog. A published batch is delivered
//! to all current subscribers at once or to none of them; the strategy
//! decides what happens when some backlog has no room for it.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use skein_core::{Callback, Canceler, Cause, Concurrency, Data, Defect, Effect, FiberId};

use crate::queue::Strategy;

struct Subscriber<A> {
    items: VecDeque<A>,
    takers: VecDeque<(u64, Callback<A, Infallible>)>,
}

impl<A: Data> Subscriber<A> {
    fn deliver(&mut self, mut item: A) {
        while let Some((_, taker)) = self.takers.pop_front() {
            match taker.try_succeed(item) {
                Ok(()) => return,
                Err(back) => item = back,
            }
        }
        self.items.push_back(item);
    }
}

struct Publisher<A> {
    id: u64,
    batch: Vec<A>,
    cb: Callback<bool, Infallible>,
}

struct HubState<A> {
    subscribers: IndexMap<u64, Subscriber<A>>,
    publishers: VecDeque<Publisher<A>>,
    next_id: u64,
    shutdown: Option<FiberId>,
    shutdown_waiters: Vec<(u64, Callback<(), Infallible>)>,
}

impl<A> HubState<A> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn has_room(&self, len: usize, cap: usize) -> bool {
        self.subscribers.values().all(|s| s.items.len() + len <= cap)
    }
}

enum Published<A> {
    Done(bool),
    Full(Vec<A>),
}

struct Hub<A> {
    strategy: Strategy,
    state: Mutex<HubState<A>>,
}

impl<A: Data> Hub<A> {
    fn broadcast(st: &mut HubState<A>, batch: &[A], cap: Option<usize>) {
        for sub in st.subscribers.values_mut() {
            for item in batch {
                sub.deliver(item.clone());
                if let Some(cap) = cap {
                    while sub.items.len() > cap {
                        sub.items.pop_front();
                    }
                }
            }
        }
    }

    fn publish_locked(&self, st: &mut HubState<A>, batch: Vec<A>) -> Published<A> {
        let Some(cap) = self.strategy.capacity() else {
            Self::broadcast(st, &batch, None);
            return Published::Done(true);
        };
        if st.publishers.is_empty() && st.has_room(batch.len(), cap) {
            Self::broadcast(st, &batch, None);
            return Published::Done(true);
        }
        match self.strategy {
            Strategy::Dropping(_) => Published::Done(false),
            Strategy::Sliding(_) => {
                Self::broadcast(st, &batch, Some(cap));
                Published::Done(true)
            }
            _ => Published::Full(batch),
        }
    }

    /// Deliver parked batches, oldest first, while every backlog has room.
    fn drain_publishers(&self, st: &mut HubState<A>) {
        let Some(cap) = self.strategy.capacity() else {
            return;
        };
        while let Some(front) = st.publishers.front() {
            if !st.has_room(front.batch.len(), cap) {
                break;
            }
            let Some(waiting) = st.publishers.pop_front() else {
                break;
            };
            if waiting.cb.try_succeed(true).is_ok() {
                Self::broadcast(st, &waiting.batch, None);
            }
        }
    }

    fn publish_or_wait(self: &Arc<Self>, batch: Vec<A>, cb: Callback<bool, Infallible>) -> Option<Canceler> {
        let mut st = self.state.lock().unwrap();
        if let Some(by) = st.shutdown {
            drop(st);
            cb.fail_cause(Cause::interrupt(by));
            return None;
        }
        match self.publish_locked(&mut st, batch) {
            Published::Done(accepted) => {
                drop(st);
                cb.succeed(accepted);
                None
            }
            Published::Full(batch) => {
                let id = st.next_id();
                st.publishers.push_back(Publisher { id, batch, cb });
                let hub = self.clone();
                Some(Box::new(move || {
                    let mut st = hub.state.lock().unwrap();
                    st.publishers.retain(|p| p.id != id);
                    // A smaller batch behind the withdrawn one may fit now.
                    hub.drain_publishers(&mut st);
                }))
            }
        }
    }

    fn take_or_wait(self: &Arc<Self>, sub: u64, cb: Callback<A, Infallible>) -> Option<Canceler> {
        let mut st = self.state.lock().unwrap();
        if let Some(by) = st.shutdown {
            drop(st);
            cb.fail_cause(Cause::interrupt(by));
            return None;
        }
        let next_id = st.next_id();
        let Some(subscriber) = st.subscribers.get_mut(&sub) else {
            drop(st);
            cb.die(Defect::message("subscription used after its scope closed"));
            return None;
        };
        match subscriber.items.pop_front() {
            Some(item) => {
                self.drain_publishers(&mut st);
                drop(st);
                cb.succeed(item);
                None
            }
            None => {
                subscriber.takers.push_back((next_id, cb));
                let hub = self.clone();
                Some(Box::new(move || {
                    if let Some(s) = hub.state.lock().unwrap().subscribers.get_mut(&sub) {
                        s.takers.retain(|(t, _)| *t != next_id);
                    }
                }))
            }
        }
    }

    fn take_up_to(&self, sub: u64, max: usize) -> Result<Vec<A>, Cause<Infallible>> {
        let mut st = self.state.lock().unwrap();
        if let Some(by) = st.shutdown {
            return Err(Cause::interrupt(by));
        }
        let Some(subscriber) = st.subscribers.get_mut(&sub) else {
            return Err(Cause::die(Defect::message(
                "subscription used after its scope closed",
            )));
        };
        let n = max.min(subscriber.items.len());
        let out: Vec<A> = subscriber.items.drain(..n).collect();
        if !out.is_empty() {
            self.drain_publishers(&mut st);
        }
        Ok(out)
    }

    fn subscribe(&self) -> Result<u64, FiberId> {
        let mut st = self.state.lock().unwrap();
        if let Some(by) = st.shutdown {
            return Err(by);
        }
        let id = st.next_id();
        st.subscribers.insert(
            id,
            Subscriber {
                items: VecDeque::new(),
                takers: VecDeque::new(),
            },
        );
        tracing::trace!(subscriber = id, total = st.subscribers.len(), "subscribed");
        Ok(id)
    }

    fn unsubscribe(&self, sub: u64) {
        let mut st = self.state.lock().unwrap();
        if st.subscribers.shift_remove(&sub).is_some() {
            tracing::trace!(subscriber = sub, total = st.subscribers.len(), "unsubscribed");
            self.drain_publishers(&mut st);
        }
    }

    fn shutdown_as(&self, by: FiberId) {
        let (subscribers, publishers, waiters) = {
            let mut st = self.state.lock().unwrap();
            if st.shutdown.is_some() {
                return;
            }
            st.shutdown = Some(by);
            (
                std::mem::take(&mut st.subscribers),
                std::mem::take(&mut st.publishers),
                std::mem::take(&mut st.shutdown_waiters),
            )
        };
        tracing::debug!(by = %by, subscribers = subscribers.len(), "pubsub shut down");
        for (_, sub) in subscribers {
            for (_, taker) in sub.takers {
                taker.fail_cause(Cause::interrupt(by));
            }
        }
        for publisher in publishers {
            publisher.cb.fail_cause(Cause::interrupt(by));
        }
        for (_, waiter) in waiters {
            waiter.succeed(());
        }
    }
}

/// A hub that delivers every published item to every subscriber.
pub struct PubSub<A> {
    hub: Arc<Hub<A>>,
}

impl<A> Clone for PubSub<A> {
    fn clone(&self) -> Self {
        Self { hub: self.hub.clone() }
    }
}

impl<A> fmt::Debug for PubSub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.hub.state.lock().unwrap();
        f.debug_struct("PubSub")
            .field("strategy", &self.hub.strategy)
            .field("subscribers", &st.subscribers.len())
            .field("shutdown", &st.shutdown.is_some())
            .finish()
    }
}

impl<A: Data> PubSub<A> {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            hub: Arc::new(Hub {
                strategy,
                state: Mutex::new(HubState {
                    subscribers: IndexMap::new(),
                    publishers: VecDeque::new(),
                    next_id: 0,
                    shutdown: None,
                    shutdown_waiters: Vec::new(),
                }),
            }),
        }
    }

    pub fn make<E: Data>(strategy: Strategy) -> Effect<PubSub<A>, E> {
        Effect::sync(move || PubSub::new(strategy))
    }

    pub fn bounded<E: Data>(capacity: usize) -> Effect<PubSub<A>, E> {
        Self::make(Strategy::Bounded(capacity))
    }

    pub fn dropping<E: Data>(capacity: usize) -> Effect<PubSub<A>, E> {
        Self::make(Strategy::Dropping(capacity))
    }

    pub fn sliding<E: Data>(capacity: usize) -> Effect<PubSub<A>, E> {
        Self::make(Strategy::Sliding(capacity))
    }

    pub fn unbounded<E: Data>() -> Effect<PubSub<A>, E> {
        Self::make(Strategy::Unbounded)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.hub.strategy.capacity()
    }

    /// Publish one item. Succeeds with whether it was delivered.
    pub fn publish<E: Data>(&self, item: A) -> Effect<bool, E> {
        self.publish_batch(vec![item])
    }

    /// Publish several items. With a bounded hub a batch larger than the
    /// capacity goes out in capacity-sized pieces; otherwise the whole
    /// batch is delivered atomically.
    pub fn publish_all<E: Data>(&self, items: impl IntoIterator<Item = A>) -> Effect<bool, E> {
        let items: Vec<A> = items.into_iter().collect();
        match self.hub.strategy {
            Strategy::Bounded(_) => {
                let cap = self.capacity().unwrap_or(usize::MAX);
                let pieces: Vec<Vec<A>> = items.chunks(cap).map(<[A]>::to_vec).collect();
                Effect::<Vec<bool>, E>::for_each(pieces, |piece| self.publish_batch(piece), Concurrency::Sequential)
                    .map(|delivered| delivered.into_iter().all(|d| d))
            }
            _ => self.publish_batch(items),
        }
    }

    fn publish_batch<E: Data>(&self, batch: Vec<A>) -> Effect<bool, E> {
        let hub = self.hub.clone();
        Effect::<bool, Infallible>::async_callback(move |cb| hub.publish_or_wait(batch.clone(), cb)).widen()
    }

    /// Subscribe for the lifetime of the current scope.
    pub fn subscribe<E: Data>(&self) -> Effect<Subscription<A>, E> {
        let hub = self.hub.clone();
        let acquire: Effect<Subscription<A>, E> = Effect::suspend(move || match hub.subscribe() {
            Ok(id) => Effect::succeed(Subscription { hub: hub.clone(), id }),
            Err(by) => Effect::fail_cause(Cause::interrupt(by)),
        });
        Effect::acquire_release(&acquire, |sub, _| {
            let hub = sub.hub.clone();
            Effect::sync(move || hub.unsubscribe(sub.id))
        })
    }

    /// Largest backlog among the current subscribers.
    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        let hub = self.hub.clone();
        Effect::sync(move || {
            let st = hub.state.lock().unwrap();
            st.subscribers.values().map(|s| s.items.len()).max().unwrap_or(0)
        })
    }

    pub fn subscriber_count<E: Data>(&self) -> Effect<usize, E> {
        let hub = self.hub.clone();
        Effect::sync(move || hub.state.lock().unwrap().subscribers.len())
    }

    /// Shut the hub down, interrupting parked publishers and takers.
    pub fn shutdown<E: Data>(&self) -> Effect<(), E> {
        let hub = self.hub.clone();
        Effect::<FiberId, E>::fiber_id().map(move |by| hub.shutdown_as(by))
    }

    pub fn is_shutdown<E: Data>(&self) -> Effect<bool, E> {
        let hub = self.hub.clone();
        Effect::sync(move || hub.state.lock().unwrap().shutdown.is_some())
    }

    pub fn await_shutdown<E: Data>(&self) -> Effect<(), E> {
        let hub = self.hub.clone();
        Effect::<(), Infallible>::async_callback(move |cb| {
            let mut st = hub.state.lock().unwrap();
            if st.shutdown.is_some() {
                drop(st);
                cb.succeed(());
                return None;
            }
            let id = st.next_id();
            st.shutdown_waiters.push((id, cb));
            let hub = hub.clone();
            Some(Box::new(move || {
                hub.state.lock().unwrap().shutdown_waiters.retain(|(w, _)| *w != id);
            }) as Canceler)
        })
        .widen()
    }
}

/// One subscriber's view of a [`PubSub`]. Valid until the scope it was
/// created in closes.
pub struct Subscription<A> {
    hub: Arc<Hub<A>>,
    id: u64,
}

impl<A> Clone for Subscription<A> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            id: self.id,
        }
    }
}

impl<A> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<A: Data> Subscription<A> {
    /// Next item in this subscriber's backlog, suspending while it is empty.
    pub fn take<E: Data>(&self) -> Effect<A, E> {
        let (hub, id) = (self.hub.clone(), self.id);
        Effect::<A, Infallible>::async_callback(move |cb| hub.take_or_wait(id, cb)).widen()
    }

    pub fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        let (hub, id) = (self.hub.clone(), self.id);
        Effect::<Vec<A>, Infallible>::suspend(move || match hub.take_up_to(id, max) {
            Ok(items) => Effect::succeed(items),
            Err(cause) => Effect::fail_cause(cause),
        })
        .widen()
    }

    pub fn take_all<E: Data>(&self) -> Effect<Vec<A>, E> {
        self.take_up_to(usize::MAX)
    }

    pub fn poll<E: Data>(&self) -> Effect<Option<A>, E> {
        self.take_up_to(1).map(|mut items| items.pop())
    }

    pub fn size<E: Data>(&self) -> Effect<usize, E> {
        let (hub, id) = (self.hub.clone(), self.id);
        Effect::sync(move || {
            let st = hub.state.lock().unwrap();
            st.subscribers.get(&id).map_or(0, |s| s.items.len())
        })
    }

    pub fn is_empty<E: Data>(&self) -> Effect<bool, E> {
        self.size().map(|n| n == 0)
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

    #[test]
    fn every_subscriber_sees_every_item() {
        let rt = Runtime::new();
        let hub: PubSub<&'static str> = PubSub::new(Strategy::Bounded(2));
        let eff: Effect<Vec<Vec<&'static str>>, Infallible> =
            Effect::<Vec<Subscription<&'static str>>, Infallible>::for_each(0..5, |_| hub.subscribe(), Concurrency::Sequential)
                .flat_map({
                    let hub = hub.clone();
                    move |subs| {
                        hub.publish_all(["a", "b"]).zip_right(&Effect::for_each(
                            subs,
                            |s| s.take_all(),
                            Concurrency::Sequential,
                        ))
                    }
                })
                .scoped();
        assert_eq!(rt.run_sync(&eff), Ok(vec![vec!["a", "b"]; 5]));
    }

    #[test]
    fn bounded_publisher_waits_for_the_slowest_subscriber() {
        let rt = runtime();
        let hub: PubSub<u32> = PubSub::new(Strategy::Bounded(2));
        let eff: Effect<(Vec<u32>, Vec<u32>), Infallible> = hub
            .subscribe()
            .zip(&hub.subscribe())
            .flat_map({
                let hub = hub.clone();
                move |(fast, slow)| {
                    let drain_fast: Effect<Vec<u32>, Infallible> =
                        Effect::for_each(0..4, |_| fast.take(), Concurrency::Sequential);
                    let (slow, hub) = (slow.clone(), hub.clone());
                    hub.publish_all::<Infallible>([1, 2, 3, 4]).fork().zip(&drain_fast.fork()).flat_map(
                        move |(publisher, reader)| {
                            let slow = slow.clone();
                            Effect::<(), Infallible>::sleep(Duration::from_millis(30))
                                .zip_right(&Effect::sync({
                                    let publisher = publisher.clone();
                                    move || assert!(!publisher.is_done())
                                }))
                                .zip_right(&Effect::for_each(0..4, |_| slow.take(), Concurrency::Sequential))
                                .zip_left(&publisher.join())
                                .zip(&reader.join())
                                .map(|(s, f)| (f, s))
                        },
                    )
                }
            })
            .scoped();
        assert_eq!(rt.run_blocking(&eff), Ok((vec![1, 2, 3, 4], vec![1, 2, 3, 4])));
    }

    #[test]
    fn dropping_hub_delivers_all_or_nothing() {
        let rt = Runtime::new();
        let hub: PubSub<i32> = PubSub::new(Strategy::Dropping(2));
        let eff: Effect<(Vec<bool>, Vec<i32>), Infallible> = hub
            .subscribe()
            .flat_map({
                let hub = hub.clone();
                move |sub| {
                    Effect::for_each([1, 2, 3], |i| hub.publish(i), Concurrency::Sequential).zip(&sub.take_all())
                }
            })
            .scoped();
        assert_eq!(rt.run_sync(&eff), Ok((vec![true, true, false], vec![1, 2])));
    }

    #[test]
    fn sliding_hub_keeps_the_newest() {
        let rt = Runtime::new();
        let hub: PubSub<i32> = PubSub::new(Strategy::Sliding(2));
        let eff: Effect<Vec<i32>, Infallible> = hub
            .subscribe()
            .flat_map({
                let hub = hub.clone();
                move |sub| hub.publish_all([1, 2, 3]).zip_right(&sub.take_all())
            })
            .scoped();
        assert_eq!(rt.run_sync(&eff), Ok(vec![2, 3]));
    }

    #[test]
    fn closing_the_scope_unsubscribes() {
        let rt = Runtime::new();
        let hub: PubSub<i32> = PubSub::new(Strategy::Bounded(1));
        let inside: Effect<usize, Infallible> = hub.subscribe().zip_right(&hub.subscriber_count()).scoped();
        assert_eq!(rt.run_sync(&inside), Ok(1));
        assert_eq!(rt.run_sync(&hub.subscriber_count::<Infallible>()), Ok(0));
        // With nobody listening a bounded publish does not wait.
        assert_eq!(rt.run_sync(&hub.publish_all::<Infallible>([1, 2, 3])), Ok(true));
    }

    #[test]
    fn shutdown_interrupts_subscribers() {
        let rt = runtime();
        let hub: PubSub<i32> = PubSub::new(Strategy::Unbounded);
        let eff: Effect<bool, Infallible> = hub
            .subscribe()
            .flat_map({
                let hub = hub.clone();
                move |sub| {
                    let hub = hub.clone();
                    sub.take::<Infallible>().fork().flat_map(move |reader| {
                        Effect::<(), Infallible>::sleep(Duration::from_millis(20))
                            .zip_right(&hub.shutdown())
                            .zip_right(&reader.await_exit())
                            .map(|exit| exit.is_interrupted())
                    })
                }
            })
            .scoped();
        assert_eq!(rt.run_blocking(&eff), Ok(true));
        assert!(rt.run_blocking_exit(&hub.publish::<Infallible>(1)).is_interrupted());
    }
}
