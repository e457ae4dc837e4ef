// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Logging from effects.
//!
//! Log calls are resolved against the fiber's context: the installed
//! `Loggers`, the `MinimumLogLevel`, annotations and open spans. The
//! default sink forwards everything to `tracing`.

use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::cause::{now_millis, FiberId};
use crate::effect::{Data, Effect};
use crate::instr::Instr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
    /// Only meaningful as a minimum level: disables logging.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
            LogLevel::Off => "OFF",
        };
        f.write_str(s)
    }
}

/// A span opened with `with_log_span`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSpan {
    pub label: String,
    pub start_millis: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub fiber: FiberId,
    pub timestamp_millis: u64,
    pub annotations: IndexMap<String, String>,
    pub spans: Vec<LogSpan>,
}

impl LogRecord {
    /// `label=elapsedms` pairs, outermost span first.
    pub fn span_timings(&self) -> Vec<(String, u64)> {
        self.spans
            .iter()
            .map(|s| (s.label.clone(), self.timestamp_millis.saturating_sub(s.start_millis)))
            .collect()
    }
}

pub trait Logger: Send + Sync + 'static {
    fn log(&self, record: &LogRecord);
}

/// Forwards records as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, record: &LogRecord) {
        let annotations = record
            .annotations
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        let spans = record
            .span_timings()
            .iter()
            .map(|(label, ms)| format!("{label}={ms}ms"))
            .collect::<Vec<_>>()
            .join(" ");
        let fiber = record.fiber;
        let msg = &record.message;
        match record.level {
            LogLevel::Trace => tracing::trace!(%fiber, %annotations, %spans, "{msg}"),
            LogLevel::Debug => tracing::debug!(%fiber, %annotations, %spans, "{msg}"),
            LogLevel::Info => tracing::info!(%fiber, %annotations, %spans, "{msg}"),
            LogLevel::Warning => tracing::warn!(%fiber, %annotations, %spans, "{msg}"),
            LogLevel::Error | LogLevel::Fatal => {
                tracing::error!(%fiber, %annotations, %spans, level = %record.level, "{msg}")
            }
            LogLevel::Off => {}
        }
    }
}

/// Keeps every record in memory.
#[derive(Clone, Default)]
pub struct MemoryLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records.lock().unwrap().iter().map(|r| r.message.clone()).collect()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl Logger for MemoryLogger {
    fn log(&self, record: &LogRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

impl fmt::Debug for MemoryLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLogger")
            .field("records", &self.records.lock().unwrap().len())
            .finish()
    }
}

/// The sinks every log call is sent to.
#[derive(Clone)]
pub struct Loggers(pub Vec<Arc<dyn Logger>>);

impl Default for Loggers {
    fn default() -> Self {
        Loggers(vec![Arc::new(TracingLogger)])
    }
}

impl fmt::Debug for Loggers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Loggers({})", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumLogLevel(pub LogLevel);

#[derive(Debug, Clone, Default)]
struct LogAnnotations(IndexMap<String, String>);

#[derive(Debug, Clone, Default)]
struct LogSpans(Vec<LogSpan>);

impl<E: Data> Effect<(), E> {
    pub fn log_at(level: LogLevel, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Effect::from_fn(move || {
            let message = message.clone();
            Instr::with_fiber(move |st| {
                let min = st
                    .context
                    .get::<MinimumLogLevel>()
                    .map_or(LogLevel::Info, |m| m.0);
                if level == LogLevel::Off || level < min {
                    return Instr::unit();
                }
                let Some(loggers) = st.context.get_ref::<Loggers>() else {
                    return Instr::unit();
                };
                let record = LogRecord {
                    level,
                    message,
                    fiber: st.id,
                    timestamp_millis: now_millis(),
                    annotations: st
                        .context
                        .get::<LogAnnotations>()
                        .unwrap_or_default()
                        .0,
                    spans: st.context.get::<LogSpans>().unwrap_or_default().0,
                };
                for logger in &loggers.0 {
                    logger.log(&record);
                }
                Instr::unit()
            })
        })
    }

    /// Log at `Info`.
    pub fn log(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Info, message)
    }

    pub fn log_trace(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Trace, message)
    }

    pub fn log_debug(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Debug, message)
    }

    pub fn log_info(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Info, message)
    }

    pub fn log_warning(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Warning, message)
    }

    pub fn log_error(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Error, message)
    }

    pub fn log_fatal(message: impl Into<String>) -> Self {
        Self::log_at(LogLevel::Fatal, message)
    }
}

impl<A: Send + 'static, E: Data> Effect<A, E> {
    /// Attach `key=value` to every log emitted by this effect.
    pub fn annotate_logs(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.with_context(move |mut ctx| {
            let mut annotations = ctx.get::<LogAnnotations>().unwrap_or_default();
            annotations.0.insert(key.clone(), value.clone());
            ctx.insert(annotations);
            ctx
        })
    }

    /// Open a span named `label` around this effect.
    pub fn with_log_span(&self, label: impl Into<String>) -> Self {
        let label = label.into();
        self.with_context(move |mut ctx| {
            let mut spans = ctx.get::<LogSpans>().unwrap_or_default();
            spans.0.push(LogSpan {
                label: label.clone(),
                start_millis: now_millis(),
            });
            ctx.insert(spans);
            ctx
        })
    }

    /// Replace every sink with `logger`.
    pub fn with_logger(&self, logger: impl Logger) -> Self {
        let loggers = Loggers(vec![Arc::new(logger)]);
        self.provide_service(loggers)
    }

    /// Send logs to `logger` as well as the current sinks.
    pub fn add_logger(&self, logger: impl Logger) -> Self {
        let logger: Arc<dyn Logger> = Arc::new(logger);
        self.with_context(move |mut ctx| {
            let mut loggers = ctx.get::<Loggers>().unwrap_or_else(|| Loggers(Vec::new()));
            loggers.0.push(logger.clone());
            ctx.insert(loggers);
            ctx
        })
    }

    pub fn with_minimum_log_level(&self, level: LogLevel) -> Self {
        self.provide_service(MinimumLogLevel(level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::convert::Infallible;

    #[test]
    fn records_carry_annotations_and_spans() {
        let rt = Runtime::new();
        let logs = MemoryLogger::new();
        let eff: Effect<(), Infallible> = Effect::log_info("inside")
            .annotate_logs("request", "42")
            .with_log_span("handler")
            .zip_right(&Effect::log_warning("outside"))
            .with_logger(logs.clone());
        rt.run_sync(&eff).unwrap();
        let records = logs.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].annotations.get("request").map(String::as_str), Some("42"));
        assert_eq!(records[0].spans[0].label, "handler");
        assert!(records[1].annotations.is_empty());
        assert!(records[1].spans.is_empty());
        assert_eq!(records[1].level, LogLevel::Warning);
    }

    #[test]
    fn minimum_level_filters() {
        let rt = Runtime::new();
        let logs = MemoryLogger::new();
        let eff: Effect<(), Infallible> = Effect::log_debug("hidden")
            .zip_right(&Effect::log_debug("shown").with_minimum_log_level(LogLevel::Debug))
            .zip_right(&Effect::log_error("loud"))
            .with_logger(logs.clone());
        rt.run_sync(&eff).unwrap();
        assert_eq!(logs.messages(), vec!["shown", "loud"]);
    }

    #[test]
    fn add_logger_keeps_existing_sinks() {
        let rt = Runtime::new();
        let (a, b) = (MemoryLogger::new(), MemoryLogger::new());
        let eff: Effect<(), Infallible> = Effect::log("both").add_logger(b.clone()).with_logger(a.clone());
        rt.run_sync(&eff).unwrap();
        assert_eq!(a.messages(), vec!["both"]);
        assert_eq!(b.messages(), vec!["both"]);
    }
}
