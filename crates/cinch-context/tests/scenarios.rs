//! End-to-end scenarios for context management.
//!
//! These drive the public API only, with a scripted model standing in for a
//! real provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cinch_context::api::recover_and_run;
use cinch_context::context::{estimate, estimate_message, repair, validate};
use cinch_context::prelude::*;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted model: answers summary requests (tools disabled) with a fixed
/// summary and rejects ordinary requests heavier than `limit` with a 413.
struct TestModel {
    limit: u64,
    summary_calls: AtomicUsize,
    chat_calls: AtomicUsize,
    yield_first: bool,
}

impl TestModel {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            summary_calls: AtomicUsize::new(0),
            chat_calls: AtomicUsize::new(0),
            yield_first: false,
        }
    }

    fn yielding(mut self) -> Self {
        self.yield_first = true;
        self
    }
}

impl ModelCaller for TestModel {
    fn invoke<'a>(
        &'a self,
        _model_id: &'a str,
        messages: &'a [Message],
        options: &'a InvokeOptions,
    ) -> CallFuture<'a, Result<String, ModelError>> {
        Box::pin(async move {
            if self.yield_first {
                tokio::task::yield_now().await;
            }
            if options.disable_tools {
                self.summary_calls.fetch_add(1, Ordering::SeqCst);
                return Ok("Earlier turns discussed the build setup.".to_string());
            }
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            let weight = estimate(messages);
            if weight > self.limit {
                return Err(ModelError::new("request entity too large").with_status(413));
            }
            Ok(format!("answered at weight {weight}"))
        })
    }
}

/// Ten user/assistant pairs, each message weighing exactly 250.
fn ten_pairs() -> Vec<Message> {
    let mut messages = vec![Message::system("sys")];
    for i in 0..10 {
        messages.push(Message::user(format!("{i}{}", "u".repeat(749))));
        messages.push(Message::assistant_text(format!("{i}{}", "a".repeat(749))));
    }
    messages
}

fn recording_sink() -> (Arc<dyn TelemetrySink>, Arc<Mutex<Vec<String>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let sink = FnTelemetry::new(move |event: &str, _payload: &Value| {
        sink_events.lock().unwrap().push(event.to_string());
    });
    (Arc::new(sink), events)
}

// ── Scenario A: one pass gets under the threshold ──────────────────────

#[tokio::test]
async fn one_pass_brings_ten_pairs_under_threshold() {
    init_tracing();
    let mut messages = ten_pairs();
    assert_eq!(estimate_message(&messages[1]), 250);
    let tail_before: Vec<Message> = messages[messages.len() - 6..].to_vec();

    let (sink, events) = recording_sink();
    let manager = ContextManager::new(
        CompactionConfig::default()
            .with_threshold(2_000)
            .with_keep_ratio(0.3),
    )
    .with_telemetry(sink);
    let model = TestModel::new(u64::MAX);
    let ctx = CallContext::new("test-model", "scenario-a");

    let changed = manager
        .run_passes(&mut messages, &model, &manager.pass_policy(), &ctx)
        .await
        .unwrap();

    assert!(changed);
    assert_eq!(model.summary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(messages.iter().filter(|m| m.is_summary()).count(), 1);
    assert_eq!(messages[0].text(), "sys");
    assert!(messages[1].is_summary());

    let tail = &messages[2..];
    assert_eq!(tail, tail_before.as_slice());
    assert!(estimate(tail) >= 600);
    assert!(estimate(&messages) < 2_000);
    assert_eq!(*events.lock().unwrap(), vec!["context.summary_run".to_string()]);
}

// ── Scenario B: drop repair of a half-answered tool turn ───────────────

#[test]
fn drop_repair_resumes_at_the_next_user_turn() {
    let messages = vec![
        Message::system("sys"),
        Message::user("list the files"),
        Message::assistant_tool_calls(vec![
            ToolCall::new("c1", "ls", "{}"),
            ToolCall::new("c2", "stat", "{}"),
        ]),
        Message::tool_result("c1", "a.txt b.txt"),
        Message::user("never mind"),
    ];
    assert!(validate(&messages).is_err());

    let outcome = repair(&messages, &RepairOptions::new(PendingMode::Drop));

    assert!(outcome.changed);
    let texts: Vec<String> = outcome.messages.iter().map(Message::text).collect();
    assert_eq!(texts, ["sys", "list the files", "never mind"]);
    assert!(validate(&outcome.messages).is_ok());

    let again = repair(&outcome.messages, &RepairOptions::new(PendingMode::Drop));
    assert!(!again.changed);
    assert_eq!(again.messages, outcome.messages);
}

// ── Scenario C: overflow survives summarize and succeeds after trim ────

struct Escalating {
    failures_left: usize,
    summarize_calls: usize,
    trim_calls: usize,
}

impl RecoverableCall for Escalating {
    type Output = &'static str;

    fn run(&mut self) -> CallFuture<'_, Result<&'static str, ModelError>> {
        Box::pin(async move {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(ModelError::new("maximum context length exceeded").with_status(400));
            }
            Ok("done")
        })
    }

    fn summarize(&mut self) -> CallFuture<'_, Result<bool, ContextError>> {
        Box::pin(async move {
            self.summarize_calls += 1;
            Ok(true)
        })
    }

    fn hard_trim(&mut self) {
        self.trim_calls += 1;
    }
}

#[tokio::test]
async fn second_overflow_escalates_to_hard_trim() {
    let mut call = Escalating {
        failures_left: 2,
        summarize_calls: 0,
        trim_calls: 0,
    };

    let output = recover_and_run(
        &mut call,
        &DefaultClassifier,
        RecoveryPolicy::default(),
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(output, Ok("done"));
    assert_eq!(call.summarize_calls, 1);
    assert_eq!(call.trim_calls, 1);
}

// ── Scenario D: cancellation between the failure and summarize ─────────

struct CancelledAfterFailure {
    cancel: CancellationToken,
    summarize_calls: usize,
}

impl RecoverableCall for CancelledAfterFailure {
    type Output = ();

    fn run(&mut self) -> CallFuture<'_, Result<(), ModelError>> {
        Box::pin(async { Err(ModelError::new("too large").with_status(413)) })
    }

    fn summarize(&mut self) -> CallFuture<'_, Result<bool, ContextError>> {
        Box::pin(async move {
            self.summarize_calls += 1;
            Ok(true)
        })
    }

    fn hard_trim(&mut self) {}

    fn on_context_error(&mut self, _err: &ContextError, _stage: RecoveryStage) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn cancellation_before_summarize_skips_it() {
    let cancel = CancellationToken::new();
    let mut call = CancelledAfterFailure {
        cancel: cancel.clone(),
        summarize_calls: 0,
    };

    let result = recover_and_run(
        &mut call,
        &DefaultClassifier,
        RecoveryPolicy::default(),
        &cancel,
    )
    .await;

    assert_eq!(result, Err(ContextError::Cancelled));
    assert_eq!(call.summarize_calls, 0);
}

// ── Through the manager ────────────────────────────────────────────────

#[tokio::test]
async fn call_model_recovers_from_overflow_by_summarizing() {
    init_tracing();
    let mut conversation = Conversation::new("s1", "sys");
    conversation.messages = ten_pairs();
    conversation.push(Message::user("and now?"));

    let manager = ContextManager::new(CompactionConfig::default().with_threshold(2_000));
    let model = TestModel::new(3_000);
    let ctx = CallContext::new("test-model", "s1");

    let reply = manager
        .call_model(&mut conversation, &model, &ctx)
        .await
        .unwrap();

    assert!(reply.starts_with("answered at weight"));
    assert_eq!(model.chat_calls.load(Ordering::SeqCst), 2);
    assert_eq!(model.summary_calls.load(Ordering::SeqCst), 1);
    assert!(conversation.messages[1].is_summary());
    assert_eq!(
        conversation.messages.last().map(Message::text).as_deref(),
        Some("and now?")
    );
}

#[tokio::test]
async fn concurrent_shared_runs_summarize_once() {
    init_tracing();
    let mut conversation = Conversation::new("shared", "sys");
    conversation.messages = ten_pairs();
    let session = Arc::new(tokio::sync::Mutex::new(conversation));

    let (sink, events) = recording_sink();
    let manager = ContextManager::new(CompactionConfig::default().with_threshold(2_000))
        .with_telemetry(sink);
    let model = Arc::new(TestModel::new(u64::MAX).yielding());
    let caller: Arc<dyn ModelCaller> = model.clone();
    let ctx = CallContext::new("test-model", "shared");

    let (first, second) = tokio::join!(
        manager.run_passes_shared(
            Arc::clone(&session),
            Arc::clone(&caller),
            manager.pass_policy(),
            ctx.clone(),
        ),
        manager.run_passes_shared(
            Arc::clone(&session),
            Arc::clone(&caller),
            manager.pass_policy(),
            ctx.clone(),
        ),
    );

    assert_eq!(first, Ok(true));
    assert_eq!(second, Ok(true));
    assert_eq!(model.summary_calls.load(Ordering::SeqCst), 1);
    assert_eq!(events.lock().unwrap().len(), 1);
    let summaries = session
        .lock()
        .await
        .messages
        .iter()
        .filter(|m| m.is_summary())
        .count();
    assert_eq!(summaries, 1);
}
