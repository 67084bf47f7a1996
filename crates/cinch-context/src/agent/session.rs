//! The session contract and a ready-made conversation store.
//!
//! The caller owns the conversation. Operations in this crate borrow it
//! through [`Session`] for one call and never keep a reference.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{Message, MessageRole};

/// Access to a caller-owned conversation.
pub trait Session: Send {
    /// The fixed system prompt that survives every trim.
    fn system_prompt(&self) -> &str;

    /// Additional system turns registered by the caller (tool guidance,
    /// memory, project notes). They also survive every trim.
    fn extra_system_prompts(&self) -> Vec<Message> {
        Vec::new()
    }

    fn messages(&self) -> &[Message];

    fn messages_mut(&mut self) -> &mut Vec<Message>;
}

/// A plain in-memory conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque identifier, used as the single-flight scope and in telemetry.
    pub id: String,
    pub system_prompt: String,
    #[serde(default)]
    pub extra_system_prompts: Vec<Message>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// A conversation seeded with its system prompt.
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            id: id.into(),
            messages: vec![Message::system(system_prompt.clone())],
            system_prompt,
            extra_system_prompts: Vec::new(),
        }
    }

    /// Register an extra system turn. It is inserted after the existing
    /// leading system turns.
    pub fn with_extra_system_prompt(mut self, content: impl Into<String>) -> Self {
        let msg = Message::system(content);
        let at = self
            .messages
            .iter()
            .take_while(|m| m.role == MessageRole::System && !m.is_summary())
            .count();
        self.messages.insert(at, msg.clone());
        self.extra_system_prompts.push(msg);
        self
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }
}

impl Session for Conversation {
    fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    fn extra_system_prompts(&self) -> Vec<Message> {
        self.extra_system_prompts.clone()
    }

    fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }
}

/// Per-call context: which model, which session, and the cancellation
/// signal for the whole operation.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub model_id: String,
    /// Opaque session identifier, used as the single-flight scope and in
    /// telemetry.
    pub session_id: String,
    pub cancel: CancellationToken,
    /// Ask for a streamed reply on conversation calls.
    pub stream: bool,
}

impl CallContext {
    pub fn new(model_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            session_id: session_id.into(),
            cancel: CancellationToken::new(),
            stream: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}
