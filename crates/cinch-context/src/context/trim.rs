//! Hard trim: the last-resort fallback when summarization cannot bring a
//! request under the model's limit.

use tracing::warn;

use crate::agent::session::Session;
use crate::{Message, MessageRole};

/// System notice inserted in place of the discarded history.
pub const HARD_TRIM_NOTICE: &str = "Earlier conversation history was discarded because it \
exceeded the context limit. If anything important from before this point is needed, \
ask the user to restate it.";

/// What a hard trim removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimOutcome {
    /// Messages in the conversation before the trim.
    pub before: usize,
    /// Messages after the trim.
    pub after: usize,
    /// Whether a user turn was found and kept.
    pub kept_user: bool,
}

/// Build the trimmed conversation: the system prompt, the extra system
/// prompts, the trim notice and the most recent user turn (if any).
pub fn hard_trimmed(system_prompt: &str, extras: &[Message], messages: &[Message]) -> Vec<Message> {
    let mut trimmed = Vec::with_capacity(extras.len() + 3);
    trimmed.push(Message::system(system_prompt));
    trimmed.extend_from_slice(extras);
    trimmed.push(Message::system(HARD_TRIM_NOTICE));
    if let Some(user) = messages.iter().rev().find(|m| m.role == MessageRole::User) {
        trimmed.push(user.clone());
    }
    trimmed
}

/// Replace the session's conversation with its hard-trimmed form. Never
/// fails.
pub fn hard_trim<S: Session + ?Sized>(session: &mut S) -> TrimOutcome {
    let extras = session.extra_system_prompts();
    let trimmed = hard_trimmed(session.system_prompt(), &extras, session.messages());
    let before = session.messages().len();
    let kept_user = trimmed.last().is_some_and(|m| m.role == MessageRole::User);
    let after = trimmed.len();
    *session.messages_mut() = trimmed;

    warn!("Hard-trimmed conversation: {before} -> {after} messages");
    TrimOutcome {
        before,
        after,
        kept_user,
    }
}
