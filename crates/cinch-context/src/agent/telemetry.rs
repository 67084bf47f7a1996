//! Telemetry sinks for context-management events.
//!
//! The crate reports what it did (summary runs, hard trims, recovery
//! transitions) through a [`TelemetrySink`]. Sinks are fire-and-forget: the
//! crate never awaits them and a panicking sink is contained by [`emit`]
//! instead of unwinding into the caller's control flow.
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`NoopTelemetry`] | Tests or callers without telemetry |
//! | [`LoggingTelemetry`] | Structured logging via `tracing` |
//! | [`FnTelemetry`] | Quick closures (metrics counters, channels) |
//! | [`CompositeTelemetry`] | Fan out to several sinks in order |

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tracing::{info, warn};

/// Fired once at the end of every summary pass run.
pub const SUMMARY_RUN_EVENT: &str = "context.summary_run";
/// Fired when the conversation is hard-trimmed.
pub const HARD_TRIM_EVENT: &str = "context.hard_trim";
/// Fired when a model call fails with a recoverable context error.
pub const CONTEXT_ERROR_EVENT: &str = "context.context_error";
/// Fired when a protocol mismatch triggers a repair-and-retry.
pub const REPAIR_EVENT: &str = "context.repair";

/// Receives telemetry events.
pub trait TelemetrySink: Send + Sync {
    fn log(&self, event: &str, payload: &Value);
}

/// Deliver one event to `sink`, containing any panic it raises.
pub fn emit(sink: &dyn TelemetrySink, event: &str, payload: &Value) {
    if catch_unwind(AssertUnwindSafe(|| sink.log(event, payload))).is_err() {
        warn!("Telemetry sink panicked on {event}; event dropped");
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn log(&self, _event: &str, _payload: &Value) {}
}

/// Logs every event via `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTelemetry;

impl TelemetrySink for LoggingTelemetry {
    fn log(&self, event: &str, payload: &Value) {
        info!(target: "cinch_context::telemetry", "{event}: {payload}");
    }
}

/// A sink backed by a closure.
///
/// ```ignore
/// let sink = FnTelemetry::new(|event, payload| {
///     metrics.record(event, payload);
/// });
/// ```
pub struct FnTelemetry<F>(F)
where
    F: Fn(&str, &Value) + Send + Sync;

impl<F> FnTelemetry<F>
where
    F: Fn(&str, &Value) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TelemetrySink for FnTelemetry<F>
where
    F: Fn(&str, &Value) + Send + Sync,
{
    fn log(&self, event: &str, payload: &Value) {
        (self.0)(event, payload)
    }
}

/// Delivers events to several sinks in registration order. A panicking sink
/// does not keep the others from seeing the event.
#[derive(Default)]
pub struct CompositeTelemetry {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl TelemetrySink for CompositeTelemetry {
    fn log(&self, event: &str, payload: &Value) {
        for sink in &self.sinks {
            emit(sink.as_ref(), event, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn panicking_sink_is_contained() {
        let sink = FnTelemetry::new(|_, _| panic!("sink failure"));
        emit(&sink, SUMMARY_RUN_EVENT, &json!({}));
    }

    #[test]
    fn composite_fans_out_past_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = {
            let seen = seen.clone();
            FnTelemetry::new(move |event, payload| {
                seen.lock().unwrap().push((event.to_string(), payload.clone()));
            })
        };
        let sink = CompositeTelemetry::new()
            .with(FnTelemetry::new(|_, _| panic!("first sink fails")))
            .with(recorder);

        emit(&sink, HARD_TRIM_EVENT, &json!({"removed": 3}));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, HARD_TRIM_EVENT);
        assert_eq!(seen[0].1["removed"], 3);
    }
}
