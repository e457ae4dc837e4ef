// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber coordination primitives.
//!
//! Everything here suspends fibers rather than threads: a blocked
//! operation parks its fiber with a callback waiter that the primitive
//! resumes later, and interrupting the fiber withdraws the waiter.
//!
//! Components:
//! - `queue`: bounded / dropping / sliding / unbounded queues
//! - `pubsub`: broadcast hub with per-subscriber backlogs
//! - `semaphore`: counting permits with scoped acquisition
//! - `synchronized`: shared cell with serialized effectful updates
//! - `subscription_ref`: shared cell that broadcasts every write

mod pubsub;
mod queue;
mod semaphore;
mod subscription_ref;
mod synchronized;

pub use pubsub::{PubSub, Subscription};
pub use queue::{Dequeue, Enqueue, Queue, QueueShutdown, Strategy};
pub use semaphore::Semaphore;
pub use subscription_ref::{Changes, SubscriptionRef};
pub use synchronized::SynchronizedRef;
