// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared cell that broadcasts every new value.

use std::fmt;
use std::sync::{Arc, Mutex};

use skein_core::{Concurrency, Data, Effect, Ref};

use crate::pubsub::{PubSub, Subscription};
use crate::queue::Strategy;
use crate::semaphore::Semaphore;

/// A [`Ref`] whose writes are serialized and published. Each `changes`
/// subscriber sees the value current when it subscribed, then every
/// later value in write order.
pub struct SubscriptionRef<A> {
    cell: Ref<A>,
    lock: Semaphore,
    hub: PubSub<A>,
}

impl<A> Clone for SubscriptionRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            lock: self.lock.clone(),
            hub: self.hub.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for SubscriptionRef<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubscriptionRef").field(&self.cell).finish()
    }
}

impl<A: Data> SubscriptionRef<A> {
    pub fn new(value: A) -> Self {
        Self {
            cell: Ref::new(value),
            lock: Semaphore::new(1),
            hub: PubSub::new(Strategy::Unbounded),
        }
    }

    pub fn make<E: Data>(value: A) -> Effect<SubscriptionRef<A>, E> {
        Effect::sync(move || SubscriptionRef::new(value.clone()))
    }

    pub fn get_now(&self) -> A {
        self.cell.get_now()
    }

    pub fn get<E: Data>(&self) -> Effect<A, E> {
        self.cell.get()
    }

    /// Compute the result and the next value with an effect, then store
    /// and publish the value. Nothing is written or published when the
    /// effect fails or is interrupted.
    pub fn modify_effect<B: Data, E: Data>(
        &self,
        f: impl Fn(A) -> Effect<(B, A), E> + Send + Sync + 'static,
    ) -> Effect<B, E> {
        let (cell, hub) = (self.cell.clone(), self.hub.clone());
        let f = Arc::new(f);
        self.lock.with_permit(&Effect::suspend(move || {
            let (cell, hub) = (cell.clone(), hub.clone());
            f(cell.get_now()).flat_map(move |(out, next)| {
                let cell = cell.clone();
                let stored = next.clone();
                Effect::sync(move || cell.set_now(stored.clone()))
                    .zip_right(&hub.publish(next))
                    .uninterruptible()
                    .as_(out)
            })
        }))
    }

    pub fn modify<B: Data, E: Data>(&self, f: impl Fn(&A) -> (B, A) + Send + Sync + 'static) -> Effect<B, E> {
        self.modify_effect(move |a| Effect::succeed(f(&a)))
    }

    pub fn set<E: Data>(&self, value: A) -> Effect<(), E> {
        self.modify(move |_| ((), value.clone()))
    }

    pub fn update<E: Data>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<(), E> {
        self.modify(move |a| ((), f(a)))
    }

    pub fn update_and_get<E: Data>(&self, f: impl Fn(&A) -> A + Send + Sync + 'static) -> Effect<A, E> {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    pub fn update_effect<E: Data>(&self, f: impl Fn(A) -> Effect<A, E> + Send + Sync + 'static) -> Effect<(), E> {
        self.modify_effect(move |a| f(a).map(|next| ((), next)))
    }

    /// Subscribe to the values for the lifetime of the current scope,
    /// starting with the current one.
    pub fn changes<E: Data>(&self) -> Effect<Changes<A>, E> {
        let cell = self.cell.clone();
        let subscribe = self.hub.subscribe().map(move |rest| Changes {
            current: Arc::new(Mutex::new(Some(cell.get_now()))),
            rest,
        });
        self.lock.with_permit(&subscribe)
    }
}

/// The stream of values seen by one `changes` subscriber.
pub struct Changes<A> {
    current: Arc<Mutex<Option<A>>>,
    rest: Subscription<A>,
}

impl<A> Clone for Changes<A> {
    fn clone(&self) -> Self {
        Self {
            current: self.current.clone(),
            rest: self.rest.clone(),
        }
    }
}

impl<A> fmt::Debug for Changes<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changes").field("rest", &self.rest).finish()
    }
}

impl<A: Data> Changes<A> {
    /// Next value, suspending until one is written.
    pub fn take<E: Data>(&self) -> Effect<A, E> {
        let (current, rest) = (self.current.clone(), self.rest.clone());
        Effect::suspend(move || match current.lock().unwrap().take() {
            Some(value) => Effect::succeed(value),
            None => rest.take(),
        })
    }

    /// The next `n` values, suspending until all have been written.
    pub fn take_n<E: Data>(&self, n: usize) -> Effect<Vec<A>, E> {
        Effect::all((0..n).map(|_| self.take()), Concurrency::Sequential)
    }

    /// Whatever is available right now, at most `max` values.
    pub fn take_up_to<E: Data>(&self, max: usize) -> Effect<Vec<A>, E> {
        let (current, rest) = (self.current.clone(), self.rest.clone());
        Effect::suspend(move || {
            let head = match max {
                0 => None,
                _ => current.lock().unwrap().take(),
            };
            let room = max - usize::from(head.is_some());
            rest.take_up_to(room).map(move |tail| head.iter().cloned().chain(tail).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::{Runtime, RuntimeConfig};
    use std::convert::Infallible;

    #[test]
    fn changes_start_with_the_current_value() {
        let rt = Runtime::new();
        let counter = SubscriptionRef::new(10);
        let bump: Effect<(), Infallible> = counter.update(|n| n + 1);
        let program: Effect<Vec<i32>, Infallible> = counter
            .changes()
            .flat_map(move |changes| {
                bump.zip_right(&bump)
                    .zip_right(&changes.take_n(3))
            })
            .scoped();
        assert_eq!(rt.run_sync(&program), Ok(vec![10, 11, 12]));
        assert_eq!(counter.get_now(), 12);
    }

    #[test]
    fn late_subscribers_skip_earlier_writes() {
        let rt = Runtime::new();
        let cell = SubscriptionRef::new("a");
        let program: Effect<Vec<&'static str>, Infallible> = cell
            .set("b")
            .zip_right(&cell.changes())
            .flat_map({
                let cell = cell.clone();
                move |changes| cell.set("c").zip_right(&changes.take_up_to(10))
            })
            .scoped();
        assert_eq!(rt.run_sync(&program), Ok(vec!["b", "c"]));
    }

    #[test]
    fn failed_updates_publish_nothing() {
        let rt = Runtime::new();
        let cell = SubscriptionRef::new(1);
        let program: Effect<Vec<i32>, String> = cell
            .changes()
            .flat_map({
                let cell = cell.clone();
                move |changes| {
                    cell.update_effect(|_| Effect::fail("refused".to_string()))
                        .either::<String>()
                        .zip_right(&cell.update_and_get(|n| n * 5))
                        .zip_right(&changes.take_up_to(10))
                }
            })
            .scoped();
        assert_eq!(rt.run_sync(&program), Ok(vec![1, 5]));
    }

    #[test]
    fn concurrent_readers_see_consecutive_values() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(4));
        let counter = SubscriptionRef::new(0u64);
        let writer: Effect<u64, Infallible> = {
            let counter = counter.clone();
            Effect::iterate(0u64, |_| true, move |i| counter.update(|n| n + 1).as_(i + 1))
        };
        let readers: Vec<Effect<Vec<u64>, Infallible>> = (1..=5)
            .map(|n| counter.changes().flat_map(move |c| c.take_n(n)).scoped())
            .collect();
        let program: Effect<Vec<Vec<u64>>, Infallible> = writer.fork().flat_map(move |w| {
            Effect::all(readers.clone(), Concurrency::Unbounded).zip_left(&w.interrupt::<Infallible>())
        });
        let chunks = rt.run_blocking(&program).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.len(), i + 1);
            assert!(chunk.windows(2).all(|w| w[1] == w[0] + 1), "{chunk:?}");
        }
    }
}
