// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Randomness capability.

use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::effect::{Data, Effect};
use crate::instr::Instr;

/// Shared random source. Clones draw from the same generator.
#[derive(Clone)]
pub struct Random {
    rng: Arc<Mutex<StdRng>>,
}

impl Random {
    pub fn new() -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Deterministic generator for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        self.rng.lock().unwrap().gen::<f64>()
    }

    pub fn next_u64(&self) -> u64 {
        self.rng.lock().unwrap().gen()
    }

    pub fn next_bool(&self) -> bool {
        self.rng.lock().unwrap().gen()
    }

    /// Uniform in `[min, max)`. Returns `min` for an empty range.
    pub fn next_f64_between(&self, min: f64, max: f64) -> f64 {
        if max <= min {
            return min;
        }
        self.rng.lock().unwrap().gen_range(min..max)
    }

    pub fn next_int_between(&self, range: Range<i64>) -> i64 {
        if range.is_empty() {
            return range.start;
        }
        self.rng.lock().unwrap().gen_range(range)
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.lock().unwrap());
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Random {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Random")
    }
}

/// The fiber's generator, falling back to a fresh one when none is
/// installed.
pub(crate) fn current(ctx: &crate::context::Context) -> Random {
    ctx.get::<Random>().unwrap_or_default()
}

impl<E: Data> Effect<Random, E> {
    pub fn random() -> Self {
        Effect::from_fn(|| Instr::with_fiber(|st| Instr::succeed(current(&st.context))))
    }
}

impl<T: Send + 'static, E: Data> Effect<T, E> {
    /// Draw from the fiber's generator.
    pub fn random_with(f: impl Fn(&Random) -> T + Send + Sync + 'static) -> Self {
        let f = std::sync::Arc::new(f);
        Effect::from_fn(move || {
            let f = f.clone();
            Instr::with_fiber(move |st| Instr::succeed(f(&current(&st.context))))
        })
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    pub fn with_random(&self, random: Random) -> Self {
        self.provide_service(random)
    }
}
