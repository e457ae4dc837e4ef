// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Skein worker runtime.
//!
//! An M:N pool of OS worker threads that run cooperatively scheduled
//! tasks, plus a dedicated timer thread. The fiber interpreter in
//! `skein-core` submits fibers here as tasks; everything above this crate
//! is unaware of threads.
//!
//! Components:
//! - `task`: Task trait and shared task handles
//! - `queue`: Work-stealing local queues + global injector
//! - `scheduler`: Worker threads + main run loop
//! - `timer`: Deadline heap serviced by a timer thread

pub mod queue;
pub mod scheduler;
pub mod task;
pub mod timer;

pub use scheduler::Scheduler;
pub use task::{Task, TaskRef};
pub use timer::{Timer, TimerKey};
