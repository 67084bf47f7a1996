//! Session-side plumbing: the [`ContextManager`] facade and its
//! collaborators.
//!
//! - [`manager::ContextManager`]: bundles configuration, classifier,
//!   telemetry and the pass manager. Start here.
//! - [`session`]: the [`Session`] contract, the in-memory
//!   [`Conversation`] and the per-call [`CallContext`].
//! - [`telemetry`]: [`TelemetrySink`] and the stock sinks.
//! - [`flight`]: [`SingleFlight`], the start-or-join registry behind
//!   shared summary runs.
//! - [`ids`]: [`IdGenerator`] implementations for tool-call repair.

pub mod flight;
pub mod ids;
pub mod manager;
pub mod session;
pub mod telemetry;

// Re-export commonly used items at the module level.
pub use flight::SingleFlight;
pub use ids::{IdGenerator, SequentialIds, TimestampIds};
pub use manager::ContextManager;
pub use session::{CallContext, Conversation, Session};
pub use telemetry::{
    CompositeTelemetry, FnTelemetry, LoggingTelemetry, NoopTelemetry, TelemetrySink,
};
