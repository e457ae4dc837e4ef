// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Recurrence policies and the retry/repeat combinators built on them.
//!
//! A [`Schedule`] is an immutable description. Each retry or repeat run
//! asks it for a fresh [`Driver`], feeds the driver one input per attempt
//! and sleeps for whatever delay the returned [`Decision`] carries.

mod ext;
mod schedule;

pub use ext::ScheduleExt;
pub use schedule::{Decision, Driver, Schedule};
