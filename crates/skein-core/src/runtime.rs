// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime entry points.
//!
//! A `Runtime` owns the worker pool and the root context every fiber
//! starts from. Effects enter through `run_sync` (caller's thread),
//! `run_blocking`, `run_future` or `run_fork`.

use std::future::Future;
use std::sync::Arc;

use skein_rt::Scheduler;

use crate::cause::FiberId;
use crate::clock::{Clock, LiveClock};
use crate::config::{Config, ConfigError, ConfigProvider, EnvConfigProvider};
use crate::context::Context;
use crate::effect::{Data, Effect};
use crate::error::{exit_to_result, AsyncFiberError, RunError};
use crate::exit::Exit;
use crate::fiber::{typed_exit, Fiber, FiberInner};
use crate::instr::{take, Instr, SharedValue};
use crate::log::{LogLevel, Loggers, MinimumLogLevel};
use crate::random::Random;

pub const DEFAULT_OPS_BEFORE_YIELD: u32 = 2048;

pub(crate) struct RuntimeShared {
    pub(crate) scheduler: Scheduler,
    pub(crate) ops_before_yield: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Worker threads; 0 picks the available parallelism.
    pub workers: usize,
    /// Instructions a fiber may run before giving up its worker.
    pub ops_before_yield: u32,
    pub minimum_log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            ops_before_yield: DEFAULT_OPS_BEFORE_YIELD,
            minimum_log_level: LogLevel::Info,
        }
    }
}

impl RuntimeConfig {
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn ops_before_yield(mut self, n: u32) -> Self {
        self.ops_before_yield = n.max(1);
        self
    }

    pub fn minimum_log_level(mut self, level: LogLevel) -> Self {
        self.minimum_log_level = level;
        self
    }

    /// Read `SKEIN_WORKERS` and `SKEIN_OPS_BEFORE_YIELD`, keeping the
    /// defaults for whatever is unset.
    pub fn from_provider(provider: &dyn ConfigProvider) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let workers = Config::<usize>::parse("SKEIN_WORKERS", "a worker count")
            .with_default(defaults.workers)
            .read(provider)?;
        let ops = Config::<u32>::parse("SKEIN_OPS_BEFORE_YIELD", "an instruction count")
            .with_default(defaults.ops_before_yield)
            .read(provider)?;
        Ok(defaults.workers(workers).ops_before_yield(ops))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_provider(&EnvConfigProvider)
    }
}

pub struct Runtime {
    shared: Arc<RuntimeShared>,
    context: Context,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let scheduler = Scheduler::new(config.workers);
        let clock: Arc<dyn Clock> = Arc::new(LiveClock::new(scheduler.timer().clone()));
        let provider: Arc<dyn ConfigProvider> = Arc::new(EnvConfigProvider);
        let context = Context::new()
            .with(clock)
            .with(Random::new())
            .with(Loggers::default())
            .with(MinimumLogLevel(config.minimum_log_level))
            .with(provider);
        tracing::debug!(
            workers = scheduler.worker_count(),
            ops_before_yield = config.ops_before_yield,
            "runtime started"
        );
        Self {
            shared: Arc::new(RuntimeShared {
                scheduler,
                ops_before_yield: config.ops_before_yield.max(1),
            }),
            context,
        }
    }

    /// Add or replace a service in the root context.
    pub fn with_service<S: Send + Sync + 'static>(mut self, service: S) -> Self {
        self.context.insert(service);
        self
    }

    /// The context every root fiber starts with.
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn worker_count(&self) -> usize {
        self.shared.scheduler.worker_count()
    }

    fn root_fiber<A: Data, E: Data>(&self, effect: &Effect<A, E>) -> Arc<FiberInner> {
        let start = effect
            .instr()
            .on_success(|v| Instr::succeed::<SharedValue>(Arc::new(take::<A>(v))));
        FiberInner::new(self.shared.clone(), self.context.clone(), true, start)
    }

    /// Drive the effect on the calling thread. Fails with
    /// `RunError::Suspended` if it has to wait for asynchronous work; the
    /// abandoned fiber is interrupted.
    pub fn run_sync<A: Data, E: Data>(&self, effect: &Effect<A, E>) -> Result<A, RunError<E>> {
        let fiber = self.root_fiber(effect);
        if fiber.run_inline() {
            exit_to_result(typed_exit(&fiber.wait_blocking()))
        } else {
            fiber.interrupt_as(FiberId::none());
            Err(RunError::Suspended(fiber.id))
        }
    }

    /// Like `run_sync`, reporting asynchronous suspension as a defect.
    pub fn run_sync_exit<A: Data, E: Data>(&self, effect: &Effect<A, E>) -> Exit<A, E> {
        let fiber = self.root_fiber(effect);
        if fiber.run_inline() {
            typed_exit(&fiber.wait_blocking())
        } else {
            fiber.interrupt_as(FiberId::none());
            Exit::die(AsyncFiberError { fiber: fiber.id })
        }
    }

    /// Run on the worker pool and block this thread until done. Do not
    /// call from inside a fiber.
    pub fn run_blocking<A: Data, E: Data>(&self, effect: &Effect<A, E>) -> Result<A, RunError<E>> {
        exit_to_result(self.run_blocking_exit(effect))
    }

    pub fn run_blocking_exit<A: Data, E: Data>(&self, effect: &Effect<A, E>) -> Exit<A, E> {
        self.run_fork(effect).await_blocking()
    }

    /// Start the effect and return a future for its result.
    pub fn run_future<A: Data, E: Data>(
        &self,
        effect: &Effect<A, E>,
    ) -> impl Future<Output = Result<A, RunError<E>>> + Send + 'static {
        let exit = self.run_fork(effect).to_future();
        async move { exit_to_result(exit.await) }
    }

    /// Start the effect on the pool without waiting.
    pub fn run_fork<A: Data, E: Data>(&self, effect: &Effect<A, E>) -> Fiber<A, E> {
        let fiber = self.root_fiber(effect);
        fiber.start();
        Fiber::from_inner(fiber)
    }

    /// Stop the workers. Fibers still running are abandoned.
    pub fn shutdown(&self) {
        self.shared.scheduler.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfigProvider;
    use std::convert::Infallible;
    use std::time::Duration;

    #[test]
    fn config_from_provider() {
        let p = MapConfigProvider::new().with("SKEIN_WORKERS", "3");
        let cfg = RuntimeConfig::from_provider(&p).unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.ops_before_yield, DEFAULT_OPS_BEFORE_YIELD);
        let bad = MapConfigProvider::new().with("SKEIN_OPS_BEFORE_YIELD", "lots");
        assert!(matches!(
            RuntimeConfig::from_provider(&bad),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn run_sync_reports_suspension() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(1));
        let eff: Effect<(), Infallible> = Effect::sleep(Duration::from_millis(10));
        assert!(matches!(rt.run_sync(&eff), Err(RunError::Suspended(_))));
        let exit = rt.run_sync_exit(&eff);
        assert!(exit.cause().is_some_and(|c| c.is_die()));
    }

    #[test]
    fn blocking_and_future_entry_points() {
        let rt = Runtime::with_config(RuntimeConfig::default().workers(2));
        let eff: Effect<u32, Infallible> = Effect::sleep(Duration::from_millis(5)).as_(7);
        assert_eq!(rt.run_blocking(&eff), Ok(7));
        assert_eq!(futures::executor::block_on(rt.run_future(&eff)), Ok(7));
        let fiber = rt.run_fork(&eff);
        assert_eq!(fiber.await_blocking(), Exit::succeed(7));
    }

    #[test]
    fn root_services() {
        #[derive(Clone, Debug, PartialEq)]
        struct Greeting(&'static str);
        let rt = Runtime::new().with_service(Greeting("hi"));
        let eff: Effect<Greeting, Infallible> = Effect::service();
        assert_eq!(rt.run_sync(&eff), Ok(Greeting("hi")));
        let missing: Effect<u128, Infallible> = Effect::service();
        assert!(rt.run_sync(&missing).unwrap_err().cause().is_some_and(|c| c.is_die()));
    }
}
