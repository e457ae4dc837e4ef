// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Effect descriptions and the fiber interpreter that runs them.
//!
//! An `Effect<A, E>` describes a computation that succeeds with `A`,
//! fails with `E`, dies with a `Defect` or is interrupted. A `Runtime`
//! runs descriptions on fibers multiplexed over the `skein-rt` worker
//! pool.
//!
//! Components:
//! - `effect`, `catch`: constructors, sequencing, error channel
//! - `fiber`, `fork`: interpreter loop, child fibers
//! - `interrupt`, `scope`: regions, finalizers, scoped resources
//! - `concurrent`: all / zip_par / race / timeout
//! - `deferred`, `refs`: one-shot cells and shared references
//! - `clock`, `random`, `log`, `config`: context capabilities
//! - `layer`: memoized service construction
//! - `cache`: keyed lookups shared between fibers

mod cache;
mod cached;
mod catch;
mod cause;
mod clock;
mod concurrent;
mod config;
mod context;
mod deferred;
mod effect;
mod error;
mod exit;
mod fiber;
mod fork;
mod instr;
mod interrupt;
mod layer;
mod log;
mod random;
mod refs;
mod runtime;
mod scope;
mod supervisor;

pub use cache::{Cache, CacheStats};
pub use catch::{TagHandlers, Tagged};
pub use cause::{AnyError, Cause, Defect, FiberId, Panicked};
pub use clock::{Clock, LiveClock, TestClock, Wake};
pub use concurrent::Concurrency;
pub use config::{Config, ConfigError, ConfigProvider, EnvConfigProvider, MapConfigProvider};
pub use context::Context;
pub use deferred::Deferred;
pub use effect::{Data, Effect};
pub use error::{AsyncFiberError, RunError, ScopeError, ServiceNotFound, TimeoutError};
pub use exit::{Exit, ScopeExit};
pub use fiber::{Callback, Canceler, ExitFuture, Fiber, FiberStatus, RuntimeFiber};
pub use interrupt::Restore;
pub use layer::Layer;
pub use log::{LogLevel, LogRecord, LogSpan, Logger, Loggers, MemoryLogger, MinimumLogLevel, TracingLogger};
pub use random::Random;
pub use refs::Ref;
pub use runtime::{Runtime, RuntimeConfig, DEFAULT_OPS_BEFORE_YIELD};
pub use scope::{FinalizerKey, Scope};
pub use supervisor::Supervisor;
