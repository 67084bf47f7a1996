//! Context-budget management for long-running LLM conversations.
//!
//! `cinch-context` keeps a conversation usable indefinitely under a hard
//! budget on total context size. It does not call the model itself; callers
//! plug in a [`ModelCaller`](api::ModelCaller) and a
//! [`Session`](agent::Session) and the crate handles the rest:
//!
//! - **Estimate** how much budget a conversation consumes
//!   ([`context::budget`]).
//! - **Compress** old turns into one synthetic summary while keeping the most
//!   recent turns verbatim ([`context::summarizer`], [`context::passes`]).
//! - **Repair** tool-call sequences broken by interrupted tool invocations
//!   ([`context::repair`]).
//! - **Recover** when the model rejects a request for being too large,
//!   escalating from summarization to a hard trim
//!   ([`api::recovery`], [`context::trim`]).
//!
//! # Getting started
//!
//! ```ignore
//! use cinch_context::prelude::*;
//!
//! let manager = ContextManager::from_env();
//! let mut conversation = Conversation::new("session-1", "You are a helpful assistant.");
//! conversation.push(Message::user("Summarize the design doc."));
//!
//! let ctx = CallContext::new("anthropic/claude-sonnet-4", "session-1");
//! let reply = manager.call_model(&mut conversation, &my_model, &ctx).await?;
//! ```
//!
//! # Where to find things
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | weight estimation, tail selection, tool-call repair, summarization passes, hard trim |
//! | [`api`] | model-caller contract, error classification, context-recovery orchestrator |
//! | [`agent`] | session contract, [`ContextManager`](agent::ContextManager) facade, telemetry, single-flight, id generation |
//! | [`config`] | [`CompactionConfig`](config::CompactionConfig) tunables and environment loading |
//! | [`error`] | [`ContextError`](error::ContextError) and [`ModelError`](error::ModelError) |

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod prelude;

#[cfg(test)]
mod testing;

use serde::{Deserialize, Serialize};

pub use error::{ContextError, ErrorKind, ModelError, Result};

/// Reserved `name` tag marking a system message as the standing summary of
/// everything compressed so far.
pub const SUMMARY_NAME: &str = "conversation_summary";

/// First line of every summary record's content.
pub const SUMMARY_HEADER: &str = "[Conversation summary]";

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// Message content: plain text, or an ordered list of typed parts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Plain text of the content. Image parts are skipped; see
    /// [`context::budget::extract_text`] for the weighted rendering.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.trim().is_empty(),
            MessageContent::Parts(parts) => parts.iter().all(|p| match p {
                ContentPart::Text { text } => text.trim().is_empty(),
                ContentPart::ImageUrl { .. } => false,
            }),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// One typed part of a multi-part message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    /// Size in bytes of the binary payload embedded in this part.
    ///
    /// Only inline `data:` URLs carry a payload; remote references weigh
    /// nothing beyond their placeholder text.
    pub fn binary_len(&self) -> usize {
        match self {
            ContentPart::Text { .. } => 0,
            ContentPart::ImageUrl { image_url } => data_url_payload_len(&image_url.url),
        }
    }
}

/// Image reference inside a [`ContentPart::ImageUrl`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

/// Decoded byte length of a `data:` URL payload.
fn data_url_payload_len(url: &str) -> usize {
    let Some(rest) = url.strip_prefix("data:") else {
        return 0;
    };
    let Some((meta, payload)) = rest.split_once(',') else {
        return 0;
    };
    if meta.ends_with(";base64") {
        let padding = payload.bytes().rev().take_while(|b| *b == b'=').count();
        (payload.len() / 4 * 3 + (payload.len() % 4).saturating_sub(1)).saturating_sub(padding)
    } else {
        payload.len()
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    fn with_role(role: MessageRole, content: Option<MessageContent>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::System, Some(MessageContent::Text(content.into())))
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(MessageRole::User, Some(MessageContent::Text(content.into())))
    }

    /// A user turn made of typed parts (text and images).
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self::with_role(MessageRole::User, Some(MessageContent::Parts(parts)))
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::with_role(
            MessageRole::Assistant,
            Some(MessageContent::Text(content.into())),
        )
    }

    pub fn assistant_tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::with_role(MessageRole::Assistant, None)
        }
    }

    /// An assistant turn carrying both text and tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::assistant_text(content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::with_role(MessageRole::Tool, Some(MessageContent::Text(content.into())))
        }
    }

    /// A summary record: a system message tagged with [`SUMMARY_NAME`].
    pub fn summary(text: impl AsRef<str>) -> Self {
        Self::system(format!("{SUMMARY_HEADER}\n{}", text.as_ref())).with_name(SUMMARY_NAME)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Plain text content (multi-part content joined by newlines).
    pub fn text(&self) -> String {
        self.content.as_ref().map(MessageContent::text).unwrap_or_default()
    }

    /// Whether this is an assistant turn with at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.role == MessageRole::Assistant
            && self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }

    /// Whether this message is a summary record.
    pub fn is_summary(&self) -> bool {
        self.role == MessageRole::System && self.name.as_deref() == Some(SUMMARY_NAME)
    }

    /// The summary text of a summary record, without its header line.
    pub fn summary_body(&self) -> Option<String> {
        if !self.is_summary() {
            return None;
        }
        let text = self.text();
        Some(match text.strip_prefix(SUMMARY_HEADER) {
            Some(rest) => rest.trim_start_matches('\n').to_string(),
            None => text,
        })
    }

    /// No text, no parts and no tool calls.
    pub fn is_blank(&self) -> bool {
        self.content.as_ref().is_none_or(MessageContent::is_empty) && !self.has_tool_calls()
    }
}

/// The most recent summary record in `messages`, if any. Older records are
/// ignored.
pub fn latest_summary(messages: &[Message]) -> Option<&Message> {
    messages.iter().rev().find(|m| m.is_summary())
}

// ── Tool call types ────────────────────────────────────────────────

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub enum CallType {
    #[default]
    #[serde(rename = "function")]
    Function,
}

/// A tool call issued by the model in an assistant turn.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}
