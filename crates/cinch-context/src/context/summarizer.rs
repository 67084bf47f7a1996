//! Summarization engine.
//!
//! One call to [`summarize`] compresses the older part of a conversation:
//!
//! 1. Leading system preambles are set aside; they are never summarized.
//! 2. The body is split with [`select_tail_start`] into a prefix to
//!    compress and a tail kept verbatim.
//! 3. The prefix is rendered into a byte-budgeted digest, newest messages
//!    first, so that when the budget runs out it is the oldest turns that
//!    fall off.
//! 4. The model condenses the digest. A "context too large" rejection halves
//!    the budget and retries.
//! 5. The conversation becomes `preambles + [summary record] + tail`.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::budget::{estimate, estimate_message, extract_text};
use super::tail::select_tail_start;
use crate::api::classify::{DefaultClassifier, ErrorClassifier, classify_model_error};
use crate::api::model::{InvokeOptions, ModelCaller};
use crate::config::{CompactionConfig, DEFAULT_BYTE_BUDGET, DEFAULT_KEEP_RATIO, MIN_BYTE_BUDGET};
use crate::error::check_cancelled;
use crate::{ContextError, Message, MessageRole, Result, latest_summary};

/// Default instruction for the summarization request.
pub const SUMMARIZATION_PROMPT: &str = "\
You condense conversation history. Summarize the conversation excerpt you are given. Focus on:
- What the user asked for and what was accomplished
- Key findings, decisions and constraints
- Failed approaches and why they failed
- File paths, identifiers and error messages (verbatim)
- What remains to be done

Rules:
- Only include facts stated in the excerpt. Do not infer or extrapolate.
- Write plain prose or short bullets. No preamble, no closing remarks.
- Do not call tools.";

/// Replaced with the rendered digest in a summarization template.
pub const HISTORY_PLACEHOLDER: &str = "{{history}}";

/// Template used when none is configured.
pub const DEFAULT_TEMPLATE: &str = "Conversation excerpt to summarize:\n\n{{history}}";

/// Separates the previous summary from the new text in append mode.
pub const SUMMARY_DELIMITER: &str = "\n\n---\n\n";

/// Record text used when the model returns nothing.
pub const EMPTY_SUMMARY_PLACEHOLDER: &str =
    "(Summary unavailable: the model returned an empty response. Earlier turns were discarded.)";

/// Attempts per call, including the first.
pub const MAX_SUMMARY_ATTEMPTS: usize = 4;

const ELLIPSIS: &str = "…";
const ENTRY_SEPARATOR: &str = "\n\n";

/// How a new summary relates to the standing one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryMode {
    /// The new record carries only the new text. An existing summary in the
    /// prefix is folded into the digest instead.
    #[default]
    Replace,
    /// The new record carries the previous summary text, a delimiter and the
    /// new text.
    Append,
}

/// Options for one [`summarize`] call.
#[derive(Clone)]
pub struct SummarizeOptions {
    /// Model that writes the summary.
    pub model_id: String,
    pub keep_ratio: f64,
    /// Starting byte budget for the digest.
    pub byte_budget: usize,
    pub system_instruction: Option<String>,
    pub template: Option<String>,
    pub mode: SummaryMode,
    pub classifier: Arc<dyn ErrorClassifier>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for SummarizeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SummarizeOptions")
            .field("model_id", &self.model_id)
            .field("keep_ratio", &self.keep_ratio)
            .field("byte_budget", &self.byte_budget)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl SummarizeOptions {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            keep_ratio: DEFAULT_KEEP_RATIO,
            byte_budget: DEFAULT_BYTE_BUDGET,
            system_instruction: None,
            template: None,
            mode: SummaryMode::Replace,
            classifier: Arc::new(DefaultClassifier),
            cancel: CancellationToken::new(),
        }
    }

    /// Options from configuration. `conversation_model` is used when no
    /// dedicated summary model is configured.
    pub fn from_config(config: &CompactionConfig, conversation_model: &str) -> Self {
        Self {
            model_id: config
                .summary_model
                .clone()
                .unwrap_or_else(|| conversation_model.to_string()),
            keep_ratio: config.keep_ratio,
            byte_budget: config.byte_budget,
            system_instruction: config.system_instruction.clone(),
            template: config.template.clone(),
            mode: config.summary_mode,
            ..Self::new(conversation_model)
        }
    }

    pub fn with_keep_ratio(mut self, ratio: f64) -> Self {
        self.keep_ratio = ratio;
        self
    }

    pub fn with_byte_budget(mut self, bytes: usize) -> Self {
        self.byte_budget = bytes;
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_mode(mut self, mode: SummaryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of one [`summarize`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummarizeOutcome {
    /// Whether the conversation was replaced.
    pub changed: bool,
    /// Text the model produced (before any append-mode merging).
    pub summary_text: Option<String>,
    /// Messages folded into the summary.
    pub summarized_count: usize,
    /// Model calls made.
    pub attempts: usize,
}

/// Compress the older part of `conversation` into one summary record.
///
/// Mutates `conversation` only on success. Returns `changed == false` when
/// there is nothing to compress (fewer than two non-preamble messages, no
/// usable split). A "context too large" rejection halves the digest budget
/// (never below [`MIN_BYTE_BUDGET`]) for up to [`MAX_SUMMARY_ATTEMPTS`]
/// calls; other failures propagate unchanged.
pub async fn summarize(
    conversation: &mut Vec<Message>,
    caller: &dyn ModelCaller,
    options: &SummarizeOptions,
) -> Result<SummarizeOutcome> {
    let preamble_len = conversation
        .iter()
        .take_while(|m| m.role == MessageRole::System && !m.is_summary())
        .count();
    let body = &conversation[preamble_len..];
    if body.len() < 2 {
        debug!("Nothing to summarize: body has {} messages", body.len());
        return Ok(SummarizeOutcome::default());
    }

    let Some(split) = select_tail_start(body, options.keep_ratio, estimate_message)
        .map(|split| align_to_tool_turns(body, split))
        .filter(|split| *split > 0)
    else {
        debug!("Nothing to summarize: no tail split");
        return Ok(SummarizeOutcome::default());
    };

    let prefix = &body[..split];
    let previous = match options.mode {
        SummaryMode::Append => latest_summary(prefix).and_then(Message::summary_body),
        SummaryMode::Replace => None,
    };
    let skip_summaries = options.mode == SummaryMode::Append;

    let mut budget = options.byte_budget.max(MIN_BYTE_BUDGET);
    let mut attempts = 0;
    let text = loop {
        check_cancelled(&options.cancel)?;
        let digest = render_digest(prefix, budget, skip_summaries);
        if digest.is_empty() {
            debug!("Nothing to summarize: prefix renders to an empty digest");
            return Ok(SummarizeOutcome::default());
        }

        let request = build_request(options, &digest);
        let invoke = InvokeOptions::without_tools(options.cancel.clone());
        attempts += 1;
        match caller.invoke(&options.model_id, &request, &invoke).await {
            Ok(text) => break text,
            Err(err) => match classify_model_error(options.classifier.as_ref(), err) {
                ContextError::ContextTooLarge(err) if attempts < MAX_SUMMARY_ATTEMPTS => {
                    let halved = (budget / 2).max(MIN_BYTE_BUDGET);
                    warn!(
                        "Summary request too large ({err}); retrying with digest budget {budget} -> {halved} bytes"
                    );
                    budget = halved;
                }
                other => return Err(other),
            },
        }
    };

    let text = text.trim();
    let text = if text.is_empty() {
        warn!("Summarization returned empty text; inserting placeholder");
        EMPTY_SUMMARY_PLACEHOLDER.to_string()
    } else {
        text.to_string()
    };
    let record_text = match previous {
        Some(previous) if !previous.trim().is_empty() => {
            format!("{previous}{SUMMARY_DELIMITER}{text}")
        }
        _ => text.clone(),
    };

    let before = estimate(conversation);
    let mut rebuilt = Vec::with_capacity(preamble_len + 1 + body.len() - split);
    rebuilt.extend_from_slice(&conversation[..preamble_len]);
    rebuilt.push(Message::summary(&record_text));
    rebuilt.extend_from_slice(&body[split..]);
    *conversation = rebuilt;

    info!(
        "Summarized {split} messages in {attempts} attempt(s): weight {before} -> {}",
        estimate(conversation)
    );
    Ok(SummarizeOutcome {
        changed: true,
        summary_text: Some(text),
        summarized_count: split,
        attempts,
    })
}

/// Move a split back so the tail never starts with a tool result cut off
/// from the assistant turn that requested it.
fn align_to_tool_turns(body: &[Message], mut split: usize) -> usize {
    while split > 0 && body[split].role == MessageRole::Tool {
        split -= 1;
    }
    split
}

fn build_request(options: &SummarizeOptions, digest: &str) -> Vec<Message> {
    let instruction = options
        .system_instruction
        .as_deref()
        .unwrap_or(SUMMARIZATION_PROMPT);
    let template = options.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
    let user = if template.contains(HISTORY_PLACEHOLDER) {
        template.replace(HISTORY_PLACEHOLDER, digest)
    } else {
        format!("{digest}\n\n{template}")
    };
    vec![Message::system(instruction), Message::user(user)]
}

fn label(msg: &Message) -> &'static str {
    if msg.is_summary() {
        return "summary";
    }
    match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

/// Render `prefix` as `[role]: text` entries within `budget` bytes.
///
/// Entries are taken newest first; the last entry that fits is cut with an
/// ellipsis so the digest fills the budget exactly, then the entries are put
/// back in chronological order.
fn render_digest(prefix: &[Message], budget: usize, skip_summaries: bool) -> String {
    let mut entries: Vec<String> = Vec::new();
    let mut used = 0;

    for msg in prefix.iter().rev() {
        if skip_summaries && msg.is_summary() {
            continue;
        }
        let text = match msg.summary_body() {
            Some(body) => body,
            None => extract_text(msg),
        };
        if text.trim().is_empty() {
            continue;
        }
        let mut entry = format!("[{}]: {text}", label(msg));
        let separator = if entries.is_empty() { 0 } else { ENTRY_SEPARATOR.len() };

        if used + separator + entry.len() <= budget {
            used += separator + entry.len();
            entries.push(entry);
            continue;
        }

        let room = budget.saturating_sub(used + separator);
        if room > ELLIPSIS.len() {
            let cut = entry.floor_char_boundary(room - ELLIPSIS.len());
            entry.truncate(cut);
            entry.push_str(ELLIPSIS);
            entries.push(entry);
        }
        break;
    }

    entries.reverse();
    entries.join(ENTRY_SEPARATOR)
}
