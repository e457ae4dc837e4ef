// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Keyed cache over an effectful lookup.
//!
//! Concurrent `get`s of one key share a single lookup. Entries leave in
//! least-recently-used order once `capacity` is exceeded, and expire
//! `ttl` of clock time after their lookup started. Failed lookups are
//! cached like successes; interrupted ones are forgotten.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;

use crate::deferred::Deferred;
use crate::effect::{Data, Effect};
use crate::exit::Exit;

/// Hit and miss counts since the cache was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

struct Entry<V, E> {
    generation: u64,
    cell: Deferred<V, E>,
    expires: Option<Duration>,
}

struct CacheState<K, V, E> {
    /// Least recently used first.
    entries: IndexMap<K, Entry<V, E>>,
    hits: u64,
    misses: u64,
}

type Lookup<K, V, E> = Arc<dyn Fn(K) -> Effect<V, E> + Send + Sync>;

struct CacheInner<K, V, E> {
    lookup: Lookup<K, V, E>,
    capacity: usize,
    ttl: Option<Duration>,
    generation: AtomicU64,
    state: Mutex<CacheState<K, V, E>>,
}

pub struct Cache<K, V, E> {
    inner: Arc<CacheInner<K, V, E>>,
}

impl<K, V, E> Clone for Cache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V, E> fmt::Debug for Cache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("capacity", &self.inner.capacity)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl<K, V, E> Cache<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Data,
    E: Data,
{
    /// A cache holding at most `capacity` keys (at least one). `None`
    /// for `ttl` keeps entries until they are evicted.
    pub fn new(
        capacity: usize,
        ttl: Option<Duration>,
        lookup: impl Fn(K) -> Effect<V, E> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                lookup: Arc::new(lookup),
                capacity: capacity.max(1),
                ttl,
                generation: AtomicU64::new(0),
                state: Mutex::new(CacheState {
                    entries: IndexMap::new(),
                    hits: 0,
                    misses: 0,
                }),
            }),
        }
    }

    pub fn make<E2: Data>(
        capacity: usize,
        ttl: Option<Duration>,
        lookup: impl Fn(K) -> Effect<V, E> + Send + Sync + 'static,
    ) -> Effect<Cache<K, V, E>, E2> {
        let lookup: Lookup<K, V, E> = Arc::new(lookup);
        Effect::sync(move || {
            let lookup = lookup.clone();
            Cache::new(capacity, ttl, move |key| lookup(key))
        })
    }

    /// The value for `key`, running the lookup unless a live entry exists.
    pub fn get(&self, key: K) -> Effect<V, E> {
        let inner = self.inner.clone();
        Effect::<Duration, E>::clock_now().flat_map(move |now| {
            let mut st = inner.state.lock().unwrap();
            if let Some(idx) = st.entries.get_index_of(&key) {
                let live = st.entries[idx].expires.map_or(true, |at| now < at);
                if live {
                    st.hits += 1;
                    let last = st.entries.len() - 1;
                    st.entries.move_index(idx, last);
                    return st.entries[last].cell.await_();
                }
                st.entries.shift_remove_index(idx);
            }
            st.misses += 1;
            let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
            let cell = Deferred::new();
            st.entries.insert(
                key.clone(),
                Entry {
                    generation,
                    cell: cell.clone(),
                    expires: inner.ttl.map(|ttl| now + ttl),
                },
            );
            while st.entries.len() > inner.capacity {
                st.entries.shift_remove_index(0);
            }
            drop(st);

            let lookup = (inner.lookup)(key.clone());
            let (owner, key) = (inner.clone(), key.clone());
            let settle = cell.clone();
            Effect::uninterruptible_mask(move |restore| {
                let (owner, key, settle) = (owner.clone(), key.clone(), settle.clone());
                restore.apply(&lookup).exit::<E>().flat_map(move |exit| {
                    if exit.is_interrupted() {
                        owner.forget(&key, generation);
                    }
                    settle.done::<E>(exit)
                })
            })
            .zip_right(&cell.await_())
        })
    }

    /// The cached value for `key` if a finished, live entry exists. Never
    /// runs the lookup.
    pub fn get_if_present<E2: Data>(&self, key: K) -> Effect<Option<Result<V, E>>, E2> {
        let inner = self.inner.clone();
        Effect::<Duration, E2>::clock_now().map(move |now| {
            let st = inner.state.lock().unwrap();
            let entry = st.entries.get(&key)?;
            if entry.expires.is_some_and(|at| now >= at) {
                return None;
            }
            match entry.cell.poll_now()? {
                Exit::Success(value) => Some(Ok(value)),
                Exit::Failure(cause) => cause.first_failure().cloned().map(Err),
            }
        })
    }

    pub fn invalidate<E2: Data>(&self, key: K) -> Effect<(), E2> {
        let inner = self.inner.clone();
        Effect::sync(move || {
            inner.state.lock().unwrap().entries.shift_remove(&key);
        })
    }

    pub fn invalidate_all<E2: Data>(&self) -> Effect<(), E2> {
        let inner = self.inner.clone();
        Effect::sync(move || inner.state.lock().unwrap().entries.clear())
    }

    pub fn stats<E2: Data>(&self) -> Effect<CacheStats, E2> {
        let inner = self.inner.clone();
        Effect::sync(move || {
            let st = inner.state.lock().unwrap();
            CacheStats {
                hits: st.hits,
                misses: st.misses,
                size: st.entries.len(),
            }
        })
    }
}

impl<K: Hash + Eq, V, E> CacheInner<K, V, E> {
    /// Drop `key` if it still holds the lookup numbered `generation`.
    fn forget(&self, key: &K, generation: u64) {
        let mut st = self.state.lock().unwrap();
        if st.entries.get(key).is_some_and(|e| e.generation == generation) {
            st.entries.shift_remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::concurrent::Concurrency;
    use crate::runtime::{Runtime, RuntimeConfig};
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    fn counting_len(calls: &Arc<AtomicUsize>) -> impl Fn(String) -> Effect<usize, String> + Send + Sync + 'static {
        let calls = calls.clone();
        move |key: String| {
            let calls = calls.clone();
            Effect::sync(move || {
                calls.fetch_add(1, Ordering::SeqCst);
                key.len()
            })
        }
    }

    #[test]
    fn concurrent_gets_share_one_lookup() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let lookup = counting_len(&calls);
        let cache = Cache::new(100, None, move |key: String| {
            lookup(key).delay(Duration::from_millis(30))
        });
        let gets = vec![cache.get("key1".to_string()); 3];
        let program: Effect<(Vec<usize>, CacheStats), String> =
            Effect::all(gets, Concurrency::Unbounded).zip(&cache.stats());
        let (values, stats) = rt.run_blocking(&program).unwrap();
        assert_eq!(values, vec![4, 4, 4]);
        assert_eq!((stats.hits, stats.misses, stats.size), (2, 1, 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn least_recently_used_keys_are_evicted() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(2, None, counting_len(&calls));
        let get = |k: &str| cache.get(k.to_string());
        let program: Effect<usize, String> = get("a")
            .zip_right(&get("bb"))
            .zip_right(&get("a"))
            .zip_right(&get("ccc"))
            .zip_right(&get("a"))
            .zip_right(&get("bb"));
        assert_eq!(rt.run_sync(&program), Ok(2));
        // a, bb, ccc, then bb again after it was evicted
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn entries_expire_with_clock_time() {
        let rt = Runtime::new();
        let clock = TestClock::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = Cache::new(10, Some(Duration::from_secs(60)), counting_len(&calls));
        let get = cache.get("key".to_string());
        let program: Effect<(), String> = get
            .zip_right(&clock.adjust(Duration::from_secs(30)))
            .zip_right(&get)
            .zip_right(&clock.adjust(Duration::from_secs(31)))
            .zip_right(&get)
            .as_unit()
            .with_clock(clock.as_clock());
        rt.run_sync(&program).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_are_cached_until_invalidated() {
        let rt = Runtime::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache: Cache<u8, u8, String> = Cache::new(10, None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Effect::fail("missing".to_string())
        });
        let twice: Effect<(Result<u8, String>, Result<u8, String>), Infallible> =
            cache.get(1).either().zip(&cache.get(1).either());
        let (first, second) = rt.run_sync(&twice).unwrap();
        assert_eq!(first, Err("missing".to_string()));
        assert_eq!(second, first);
        assert_eq!(
            rt.run_sync(&cache.get_if_present::<Infallible>(1)),
            Ok(Some(Err("missing".to_string())))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        rt.run_sync(&cache.invalidate::<Infallible>(1)).unwrap();
        assert_eq!(rt.run_sync(&cache.get_if_present::<Infallible>(1)), Ok(None));
        let _ = rt.run_sync(&cache.get(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn interrupted_lookups_are_retried() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache: Cache<u8, u8, Infallible> = Cache::new(10, None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Effect::<(), Infallible>::sleep(Duration::from_millis(200)).as_(7)
        });
        let cut_short: Effect<Option<u8>, Infallible> = cache.get(1).timeout_option(Duration::from_millis(10));
        assert_eq!(rt.run_blocking(&cut_short), Ok(None));
        assert_eq!(rt.run_blocking(&cache.get(1)), Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
