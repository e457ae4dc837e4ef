// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein: typed effects run on lightweight fibers.
//!
//! This crate gathers the workspace behind one name. `skein-core` holds
//! the effect type and its interpreter, `skein-sync` the coordination
//! primitives, `skein-schedule` retry and repeat policies.
//!
//! ```ignore
//! use skein::prelude::*;
//!
//! let rt = Runtime::new();
//! let answer: Effect<u32, String> = Effect::succeed(21).map(|n| n * 2);
//! assert_eq!(rt.run_sync(&answer), Ok(42));
//! ```

pub use skein_core::*;
pub use skein_schedule::{Decision, Driver, Schedule, ScheduleExt};
pub use skein_sync::{
    Changes, Dequeue, Enqueue, PubSub, Queue, QueueShutdown, Semaphore, Strategy, Subscription, SubscriptionRef,
    SynchronizedRef,
};

pub mod prelude {
    pub use skein_core::{
        Cause, Concurrency, Config, Data, Deferred, Effect, Exit, Fiber, FiberId, Layer, Ref, RunError, Runtime,
        RuntimeConfig, Scope, TestClock,
    };
    pub use skein_schedule::{Schedule, ScheduleExt};
    pub use skein_sync::{PubSub, Queue, Semaphore, SubscriptionRef, SynchronizedRef};
}
