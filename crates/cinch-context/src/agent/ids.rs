//! Tool-call id generation for the repair pass.
//!
//! The repairer never invents ids on its own: callers inject an
//! [`IdGenerator`] when missing or colliding call ids should be rewritten.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Source of fresh tool-call ids.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

impl<F> IdGenerator for F
where
    F: Fn() -> String + Send + Sync,
{
    fn next_id(&self) -> String {
        self()
    }
}

/// Deterministic ids: `{prefix}{n}` with `n` counting from 1.
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{n}", self.prefix)
    }
}

/// Bumped on every [`TimestampIds`] id so two ids minted in the same
/// nanosecond still differ.
static TIMESTAMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-unique ids: `call_{nanos:x}_{seq:04x}`.
#[derive(Debug, Default)]
pub struct TimestampIds;

impl IdGenerator for TimestampIds {
    fn next_id(&self) -> String {
        let nanos = SystemTime::UNIX_EPOCH
            .elapsed()
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let seq = TIMESTAMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("call_{nanos:x}_{seq:04x}")
    }
}
