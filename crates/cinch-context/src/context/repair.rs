//! Tool-call sequence repair.
//!
//! Chat APIs require every assistant turn that issues tool calls to be
//! followed by exactly one tool result per call before any other turn.
//! Interrupted tool runs (a crash, a cancelled stream, a user typing over a
//! running tool) leave sequences that break this rule, and the next request
//! fails. [`repair`] walks a message list and rewrites it into a valid one;
//! [`validate`] only reports the first violation.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::agent::ids::IdGenerator;
use crate::{ContextError, Message, MessageRole, Result};

/// Generator draws tried for a colliding id before falling back to a suffix.
const MAX_GENERATOR_ATTEMPTS: usize = 8;

/// What to do with an assistant turn whose calls were not all answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingMode {
    /// Keep the turn's text, clear its call list and remove the partial
    /// results that followed it. A turn left with no text is removed
    /// instead of being kept empty.
    #[default]
    Strip,
    /// Delete the turn and everything emitted since it opened.
    Drop,
}

/// Options for [`repair`].
#[derive(Clone)]
pub struct RepairOptions {
    pub pending_mode: PendingMode,
    /// Source of replacement ids for missing or colliding call ids. Without
    /// one, missing ids are left as they are and collisions get a numeric
    /// suffix.
    pub id_generator: Option<Arc<dyn IdGenerator>>,
    /// Rewrite a call id repeated within one assistant turn.
    pub dedupe_ids: bool,
    /// With `dedupe_ids`, also rewrite ids reused from earlier turns. Off by
    /// default: providers that number calls per turn emit `call_0` on every
    /// turn and such sequences are valid.
    pub dedupe_across_turns: bool,
    /// A tool result without an id answers the next unanswered call.
    pub assign_missing_result_ids: bool,
}

impl Default for RepairOptions {
    fn default() -> Self {
        Self {
            pending_mode: PendingMode::Strip,
            id_generator: None,
            dedupe_ids: true,
            dedupe_across_turns: false,
            assign_missing_result_ids: true,
        }
    }
}

impl fmt::Debug for RepairOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepairOptions")
            .field("pending_mode", &self.pending_mode)
            .field("id_generator", &self.id_generator.is_some())
            .field("dedupe_ids", &self.dedupe_ids)
            .field("dedupe_across_turns", &self.dedupe_across_turns)
            .field("assign_missing_result_ids", &self.assign_missing_result_ids)
            .finish()
    }
}

impl RepairOptions {
    pub fn new(pending_mode: PendingMode) -> Self {
        Self {
            pending_mode,
            ..Default::default()
        }
    }

    pub fn with_id_generator(mut self, generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    pub fn with_dedupe_ids(mut self, dedupe: bool) -> Self {
        self.dedupe_ids = dedupe;
        self
    }

    pub fn with_dedupe_across_turns(mut self, across: bool) -> Self {
        self.dedupe_across_turns = across;
        self
    }

    pub fn with_assign_missing_result_ids(mut self, assign: bool) -> Self {
        self.assign_missing_result_ids = assign;
        self
    }
}

/// Result of a [`repair`] pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub messages: Vec<Message>,
    /// Whether the output differs from the input. Callers skip rewriting
    /// their store when this is false.
    pub changed: bool,
    /// Messages removed (orphaned or rejected results, dropped turns).
    pub dropped: usize,
    /// Assistant turns whose call list was cleared.
    pub stripped: usize,
}

struct PendingCall {
    /// Id as it appeared in the input, before any rewrite.
    original: String,
    id: String,
    answered: bool,
}

/// Calls of the most recent assistant turn still waiting for results.
struct PendingSet {
    /// Position of the assistant turn in the output list.
    assistant_index: usize,
    calls: Vec<PendingCall>,
}

impl PendingSet {
    fn is_complete(&self) -> bool {
        self.calls.iter().all(|c| c.answered)
    }

    /// Claim the call a result with `id` answers. Rewritten ids are still
    /// matched by their original value.
    fn claim(&mut self, id: &str) -> Option<&str> {
        let call = self
            .calls
            .iter_mut()
            .filter(|c| !c.answered)
            .find(|c| c.id == id || c.original == id)?;
        call.answered = true;
        Some(call.id.as_str())
    }

    fn claim_next(&mut self) -> Option<&str> {
        let call = self.calls.iter_mut().find(|c| !c.answered)?;
        call.answered = true;
        Some(call.id.as_str())
    }
}

struct Repairer<'a> {
    options: &'a RepairOptions,
    out: Vec<Message>,
    pending: Option<PendingSet>,
    /// Ids in use: this turn's, or the whole output's with
    /// `dedupe_across_turns`.
    seen_ids: HashSet<String>,
    changed: bool,
    dropped: usize,
    stripped: usize,
}

impl Repairer<'_> {
    fn push_assistant_with_calls(&mut self, mut msg: Message) {
        if !self.options.dedupe_across_turns {
            self.seen_ids.clear();
        }
        let mut calls = Vec::new();
        for call in msg.tool_calls.iter_mut().flatten() {
            let original = call.id.clone();
            if call.id.is_empty()
                && let Some(generator) = &self.options.id_generator
            {
                call.id = generator.next_id();
                self.changed = true;
            }
            if self.options.dedupe_ids && !call.id.is_empty() && self.seen_ids.contains(&call.id) {
                call.id = self.fresh_id(&call.id);
                self.changed = true;
            }
            self.seen_ids.insert(call.id.clone());
            calls.push(PendingCall {
                original,
                id: call.id.clone(),
                answered: false,
            });
        }
        self.pending = Some(PendingSet {
            assistant_index: self.out.len(),
            calls,
        });
        self.out.push(msg);
    }

    fn fresh_id(&self, base: &str) -> String {
        if let Some(generator) = &self.options.id_generator {
            let fresh = (0..MAX_GENERATOR_ATTEMPTS)
                .map(|_| generator.next_id())
                .find(|id| !id.is_empty() && !self.seen_ids.contains(id));
            if let Some(id) = fresh {
                return id;
            }
            debug!("Id generator kept colliding with {base:?}; using a suffix");
        }
        (2..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.seen_ids.contains(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    fn push_tool_result(&mut self, index: usize, mut msg: Message) {
        let Some(pending) = self.pending.as_mut() else {
            debug!("Dropping orphaned tool result at index {index}");
            self.reject();
            return;
        };

        let claimed = match msg.tool_call_id.as_deref() {
            Some(id) if !id.is_empty() => pending.claim(id).map(str::to_string),
            _ if self.options.assign_missing_result_ids => pending.claim_next().map(str::to_string),
            _ => None,
        };
        let Some(call_id) = claimed else {
            debug!(
                "Rejecting tool result at index {index} with unexpected id {:?}",
                msg.tool_call_id
            );
            self.reject();
            return;
        };

        if msg.tool_call_id.as_deref() != Some(call_id.as_str()) {
            msg.tool_call_id = Some(call_id);
            self.changed = true;
        }
        let complete = pending.is_complete();
        self.out.push(msg);
        if complete {
            self.pending = None;
        }
    }

    fn reject(&mut self) {
        self.dropped += 1;
        self.changed = true;
    }

    /// Resolve an open pending set that can no longer be completed.
    fn resolve_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let at = pending.assistant_index;
        let unanswered: Vec<&str> = pending
            .calls
            .iter()
            .filter(|c| !c.answered)
            .map(|c| c.id.as_str())
            .collect();

        match self.options.pending_mode {
            PendingMode::Drop => {
                let removed = self.out.len() - at;
                debug!("Dropping assistant turn at {at} with unanswered calls {unanswered:?} ({removed} messages)");
                self.out.truncate(at);
                self.dropped += removed;
            }
            PendingMode::Strip => {
                let removed = self.out.len() - at - 1;
                debug!("Stripping calls from assistant turn at {at}; unanswered {unanswered:?}");
                self.out.truncate(at + 1);
                self.dropped += removed;
                self.stripped += 1;
                if let Some(turn) = self.out.last_mut() {
                    turn.tool_calls = None;
                    if turn.is_blank() {
                        self.out.pop();
                        self.dropped += 1;
                    }
                }
            }
        }
        self.changed = true;
    }
}

/// Rewrite `messages` so every tool call is answered, in order.
///
/// Pure: the input is not touched and the caller decides whether to persist
/// the result. A fully answered sequence comes back identical with
/// `changed == false`.
pub fn repair(messages: &[Message], options: &RepairOptions) -> RepairOutcome {
    let mut repairer = Repairer {
        options,
        out: Vec::with_capacity(messages.len()),
        pending: None,
        seen_ids: HashSet::new(),
        changed: false,
        dropped: 0,
        stripped: 0,
    };

    for (index, msg) in messages.iter().enumerate() {
        if msg.role == MessageRole::Tool {
            repairer.push_tool_result(index, msg.clone());
            continue;
        }
        repairer.resolve_pending();
        if msg.has_tool_calls() {
            repairer.push_assistant_with_calls(msg.clone());
        } else {
            repairer.out.push(msg.clone());
        }
    }
    repairer.resolve_pending();

    let Repairer {
        out,
        changed,
        dropped,
        stripped,
        ..
    } = repairer;
    if changed {
        info!(
            "Repaired tool-call sequence: {} -> {} messages ({dropped} dropped, {stripped} stripped)",
            messages.len(),
            out.len()
        );
    }
    RepairOutcome {
        messages: out,
        changed,
        dropped,
        stripped,
    }
}

/// Check the tool-call invariant without rewriting anything.
///
/// Returns [`ContextError::ProtocolMismatch`] describing the first
/// violation found.
pub fn validate(messages: &[Message]) -> Result<()> {
    let mismatch = |detail: String| Err(ContextError::ProtocolMismatch(detail));
    // (assistant index, unanswered ids)
    let mut pending: Option<(usize, Vec<&str>)> = None;

    for (index, msg) in messages.iter().enumerate() {
        if msg.role == MessageRole::Tool {
            let Some((_, expected)) = pending.as_mut() else {
                return mismatch(format!("tool result at index {index} has no preceding tool call"));
            };
            let id = msg.tool_call_id.as_deref().unwrap_or_default();
            let Some(pos) = expected.iter().position(|e| *e == id) else {
                return mismatch(format!(
                    "tool result at index {index} references unknown call id {id:?}"
                ));
            };
            expected.remove(pos);
            if expected.is_empty() {
                pending = None;
            }
            continue;
        }

        if let Some((at, expected)) = &pending {
            return mismatch(format!(
                "assistant turn at index {at} has unanswered tool calls {expected:?}"
            ));
        }
        if msg.has_tool_calls() {
            let calls = msg.tool_calls.iter().flatten();
            let ids: Vec<&str> = calls.map(|c| c.id.as_str()).collect();
            if ids.iter().any(|id| id.is_empty()) {
                return mismatch(format!("assistant turn at index {index} has a tool call without an id"));
            }
            pending = Some((index, ids));
        }
    }

    match pending {
        Some((at, expected)) => mismatch(format!(
            "assistant turn at index {at} has unanswered tool calls {expected:?}"
        )),
        None => Ok(()),
    }
}
