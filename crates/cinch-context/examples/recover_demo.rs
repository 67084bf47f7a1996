//! Overflow recovery walkthrough with a scripted model.
//!
//! The "model" rejects any request heavier than its limit with HTTP 413, the
//! way a real provider rejects an over-long prompt. The conversation grows
//! until it no longer fits; `ContextManager::call_model` then summarizes the
//! older turns and retries without the caller doing anything.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=cinch_context=debug cargo run --example recover_demo
//! ```

use std::sync::Arc;

use cinch_context::context::estimate;
use cinch_context::prelude::*;
use tracing_subscriber::EnvFilter;

/// Weight above which the scripted model refuses a request.
const MODEL_LIMIT: u64 = 3_000;

struct ScriptedModel;

impl ModelCaller for ScriptedModel {
    fn invoke<'a>(
        &'a self,
        _model_id: &'a str,
        messages: &'a [Message],
        options: &'a InvokeOptions,
    ) -> CallFuture<'a, Result<String, ModelError>> {
        Box::pin(async move {
            if options.cancel.is_cancelled() {
                return Err(ModelError::cancelled());
            }
            let weight = estimate(messages);
            if weight > MODEL_LIMIT {
                return Err(ModelError::new(format!(
                    "request of ~{weight} weight exceeds the {MODEL_LIMIT} limit"
                ))
                .with_status(413));
            }
            if options.disable_tools {
                return Ok("The user asked a series of questions about Rust ownership; \
                           each was answered with examples."
                    .to_string());
            }
            let question = messages.last().map(Message::text).unwrap_or_default();
            let topic: String = question.chars().take(40).collect();
            Ok(format!("Here is an answer about {topic}. {}", "detail ".repeat(120)))
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), ContextError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 1. Configure: summarize once the conversation passes 2,500 weight.
    let config = CompactionConfig::from_env().with_threshold(2_500);
    let manager = ContextManager::new(config).with_telemetry(Arc::new(LoggingTelemetry));

    // 2. A session and a model.
    let mut conversation = Conversation::new("demo", "You are a patient Rust tutor.");
    let model = ScriptedModel;
    let ctx = CallContext::new("scripted/tutor", "demo");

    // 3. Keep talking until the context would overflow several times over.
    for round in 1..=12 {
        conversation.push(Message::user(format!(
            "Question {round}: explain borrowing rule #{round} with an example."
        )));
        let reply = manager.call_model(&mut conversation, &model, &ctx).await?;
        conversation.push(Message::assistant_text(reply));

        let usage = manager.usage(&conversation.messages);
        let summaries = conversation.messages.iter().filter(|m| m.is_summary()).count();
        println!(
            "round {round:>2}: {} messages, {} (summary records: {summaries})",
            conversation.messages.len(),
            usage.to_log_string(),
        );
    }

    Ok(())
}
