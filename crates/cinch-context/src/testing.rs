//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::api::model::{CallFuture, InvokeOptions, ModelCaller};
use crate::{Message, ModelError};

/// One recorded [`ModelCaller::invoke`] call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub disable_tools: bool,
    pub stream: bool,
}

/// A model that replays scripted replies in order and records every call.
/// Once the script runs out it answers with a fixed short text.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ModelError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    pub fn new(replies: impl IntoIterator<Item = Result<String, ModelError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ModelCaller for ScriptedModel {
    fn invoke<'a>(
        &'a self,
        model_id: &'a str,
        messages: &'a [Message],
        options: &'a InvokeOptions,
    ) -> CallFuture<'a, Result<String, ModelError>> {
        self.calls.lock().unwrap().push(RecordedCall {
            model_id: model_id.to_string(),
            messages: messages.to_vec(),
            disable_tools: options.disable_tools,
            stream: options.stream,
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("summary".to_string()));
        Box::pin(async move { reply })
    }
}
