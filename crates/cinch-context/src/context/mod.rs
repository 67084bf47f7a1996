//! Context window management: weights, tails, repair, summarization, trimming.
//!
//! The context window is the scarcest resource in any long conversation.
//! This module provides the layered strategies that keep it under control:
//!
//! 1. **[`budget`]**: estimates the weight (token proxy) of messages.
//!
//! 2. **[`tail`]**: picks the split between the older prefix to compress
//!    and the recent tail kept verbatim. Never drops the latest user turn.
//!
//! 3. **[`repair`]**: restores the "every tool call is answered, in order"
//!    invariant after interrupted tool invocations.
//!
//! 4. **[`summarizer`]**: renders a byte-budgeted digest of the prefix,
//!    asks the model for a condensed narrative and splices it back in as one
//!    summary record.
//!
//! 5. **[`passes`]**: drives the summarizer until the conversation is under
//!    its threshold or no more progress is possible.
//!
//! 6. **[`trim`]**: last-resort hard trim down to preambles and the latest
//!    user turn.

pub mod budget;
pub mod passes;
pub mod repair;
pub mod summarizer;
pub mod tail;
pub mod trim;

// Re-export commonly used items at the module level.
pub use budget::{BYTES_PER_WEIGHT, ContextUsage, estimate, estimate_message, extract_text};
pub use passes::{PassPolicy, PassReport, PassResult, SummaryPassManager};
pub use repair::{PendingMode, RepairOptions, RepairOutcome, repair, validate};
pub use summarizer::{SUMMARY_DELIMITER, SummarizeOptions, SummarizeOutcome, SummaryMode, summarize};
pub use tail::select_tail_start;
pub use trim::{HARD_TRIM_NOTICE, TrimOutcome, hard_trim, hard_trimmed};
