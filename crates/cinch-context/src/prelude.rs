//! Convenience re-exports for common `cinch-context` types.
//!
//! Meant to be glob-imported by callers wiring context management into
//! their agent loop:
//!
//! ```ignore
//! use cinch_context::prelude::*;
//! ```
//!
//! Lower-level pieces (the summarizer's options, the single-flight registry,
//! digest rendering) are left out; import those from their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ContentPart, ContextError, ErrorKind, Message, MessageRole, ModelError, ToolCall,
};

// ── Session side ────────────────────────────────────────────────────
pub use crate::agent::{
    CallContext, ContextManager, Conversation, FnTelemetry, IdGenerator, LoggingTelemetry,
    NoopTelemetry, SequentialIds, Session, TelemetrySink,
};

// ── Model side ──────────────────────────────────────────────────────
pub use crate::api::{
    CallFuture, DefaultClassifier, ErrorClassifier, InvokeOptions, ModelCaller, RecoverableCall,
    RecoveryPolicy, RecoveryStage,
};

// ── Configuration and context management ───────────────────────────
pub use crate::config::CompactionConfig;
pub use crate::context::{ContextUsage, PassPolicy, PendingMode, RepairOptions, SummaryMode};
