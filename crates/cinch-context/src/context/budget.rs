//! Weight estimation: the crate's proxy for token usage.
//!
//! A message's weight is `ceil((text bytes + binary payload bytes) / 3)`.
//! This is a heuristic, not a tokenizer: it is monotonic in content size
//! and roughly proportional to it, which is all the compaction logic needs.
//! Text includes multi-part text joined by newlines, a placeholder tag for
//! each image part, and the name and arguments of every tool call.

use crate::{ContentPart, Message, MessageContent};

/// Bytes per unit of weight.
pub const BYTES_PER_WEIGHT: u64 = 3;

/// Plain-text rendering of a message as the model would see it.
///
/// Image parts render as `[image: N bytes]`; tool calls render as
/// `[tool call name: arguments]` lines after the text.
pub fn extract_text(msg: &Message) -> String {
    let mut text = match &msg.content {
        None => String::new(),
        Some(MessageContent::Text(t)) => t.clone(),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => text.clone(),
                ContentPart::ImageUrl { .. } => format!("[image: {} bytes]", part.binary_len()),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };

    for call in msg.tool_calls.iter().flatten() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!(
            "[tool call {}: {}]",
            call.function.name, call.function.arguments
        ));
    }
    text
}

fn binary_len(msg: &Message) -> usize {
    match &msg.content {
        Some(MessageContent::Parts(parts)) => parts.iter().map(ContentPart::binary_len).sum(),
        _ => 0,
    }
}

/// Weight of a single message.
pub fn estimate_message(msg: &Message) -> u64 {
    let bytes = extract_text(msg).len() + binary_len(msg);
    (bytes as u64).div_ceil(BYTES_PER_WEIGHT)
}

/// Total weight of a message list.
pub fn estimate(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message).sum()
}

/// Snapshot of a conversation's weight against its threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    /// Estimated weight of the conversation.
    pub weight: u64,
    /// Threshold above which summarization runs.
    pub threshold: u64,
    /// Usage as a fraction of the threshold (0.0 to 1.0+).
    pub usage_pct: f64,
}

impl ContextUsage {
    pub fn measure(messages: &[Message], threshold: u64) -> Self {
        let weight = estimate(messages);
        let usage_pct = if threshold > 0 {
            weight as f64 / threshold as f64
        } else {
            1.0
        };
        Self {
            weight,
            threshold,
            usage_pct,
        }
    }

    /// Whether the conversation has reached its threshold.
    pub fn over_threshold(&self) -> bool {
        self.weight >= self.threshold
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        format!(
            "context: ~{} weight ({:.0}% of {})",
            self.weight,
            self.usage_pct * 100.0,
            self.threshold,
        )
    }
}
