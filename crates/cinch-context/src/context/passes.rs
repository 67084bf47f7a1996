//! Summary pass manager.
//!
//! Runs the summarizer repeatedly until the conversation is under its
//! threshold, no pass makes progress, or the pass limit is hit. Every run
//! ends with exactly one telemetry event, whether or not anything was
//! summarized and whether or not the run failed.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::budget::estimate;
use super::summarizer::{SummarizeOptions, summarize};
use crate::agent::flight::SingleFlight;
use crate::agent::session::{CallContext, Session};
use crate::agent::telemetry::{NoopTelemetry, SUMMARY_RUN_EVENT, TelemetrySink, emit};
use crate::api::classify::{DefaultClassifier, ErrorClassifier};
use crate::api::model::ModelCaller;
use crate::config::CompactionConfig;
use crate::error::check_cancelled;
use crate::{ContextError, Message, ModelError, Result};

/// When and how hard to summarize.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassPolicy {
    /// Summarize at least once regardless of weight, and keep going until
    /// the weight is under the forced target.
    pub force: bool,
    pub threshold: u64,
    pub keep_ratio: f64,
}

impl PassPolicy {
    pub fn from_config(config: &CompactionConfig) -> Self {
        Self {
            force: false,
            threshold: config.threshold,
            keep_ratio: config.keep_ratio,
        }
    }

    pub fn forced(config: &CompactionConfig) -> Self {
        Self {
            force: true,
            ..Self::from_config(config)
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassResult {
    pub changed: bool,
    pub before_weight: u64,
    pub after_weight: u64,
    pub summary_text: Option<String>,
}

/// Telemetry payload for one run.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub forced: bool,
    pub threshold: u64,
    pub keep_ratio: f64,
    /// Before/after weights of the last pass that ran.
    pub before_weight: Option<u64>,
    pub after_weight: Option<u64>,
    pub summarized: bool,
    pub session_id: String,
    pub passes: Vec<PassResult>,
    pub error: Option<String>,
    /// RFC 3339 timestamp of the end of the run.
    pub at: String,
}

/// Drives [`summarize`] through up to N passes.
#[derive(Clone)]
pub struct SummaryPassManager {
    config: CompactionConfig,
    classifier: Arc<dyn ErrorClassifier>,
    telemetry: Arc<dyn TelemetrySink>,
    flights: SingleFlight<Result<bool>>,
}

impl SummaryPassManager {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(DefaultClassifier),
            telemetry: Arc::new(NoopTelemetry),
            flights: SingleFlight::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Summarize `conversation` until it fits `policy`.
    ///
    /// Returns whether any pass replaced the conversation. Cancellation is
    /// checked before and after every pass.
    pub async fn run(
        &self,
        conversation: &mut Vec<Message>,
        caller: &dyn ModelCaller,
        policy: &PassPolicy,
        ctx: &CallContext,
    ) -> Result<bool> {
        let mut passes = Vec::new();
        let outcome = self.run_passes(conversation, caller, policy, ctx, &mut passes).await;
        self.report(policy, ctx, passes, &outcome);
        outcome
    }

    /// [`run`](Self::run) under the single-flight policy: concurrent calls
    /// for the same `scope` join the run already in flight and receive its
    /// result instead of starting another.
    ///
    /// The run holds the session lock until it finishes, even if every
    /// caller stops waiting. Each caller's own cancellation token ends its
    /// wait with [`ContextError::Cancelled`]; only the token of the caller
    /// that started the run cancels the run itself.
    pub async fn run_shared<S>(
        &self,
        scope: &str,
        session: Arc<tokio::sync::Mutex<S>>,
        caller: Arc<dyn ModelCaller>,
        policy: PassPolicy,
        ctx: CallContext,
    ) -> Result<bool>
    where
        S: Session + 'static,
    {
        let cancel = ctx.cancel.clone();
        let manager = self.clone();
        let flight = self.flights.run(scope, move || async move {
            let mut session = session.lock().await;
            manager
                .run(session.messages_mut(), caller.as_ref(), &policy, &ctx)
                .await
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stopped waiting on shared run for scope {scope}: cancelled");
                Err(ContextError::Cancelled)
            }
            output = flight => output.unwrap_or_else(|| {
                Err(ContextError::Model(ModelError::new(format!(
                    "summary run for scope {scope} ended without a result"
                ))))
            }),
        }
    }

    async fn run_passes(
        &self,
        conversation: &mut Vec<Message>,
        caller: &dyn ModelCaller,
        policy: &PassPolicy,
        ctx: &CallContext,
        passes: &mut Vec<PassResult>,
    ) -> Result<bool> {
        let max_passes = if policy.force {
            self.config.max_forced_passes
        } else {
            self.config.max_passes
        };
        let forced_target = self.config.forced_target(policy.threshold);
        let options = SummarizeOptions::from_config(&self.config, &ctx.model_id)
            .with_keep_ratio(policy.keep_ratio)
            .with_classifier(Arc::clone(&self.classifier))
            .with_cancel(ctx.cancel.clone());

        let mut summarized = false;
        for pass in 0..max_passes {
            check_cancelled(&ctx.cancel)?;
            let before = estimate(conversation);
            if !policy.force && before < policy.threshold {
                debug!("Weight {before} under threshold {}; stopping", policy.threshold);
                break;
            }
            if policy.force && pass > 0 && before < forced_target {
                debug!("Weight {before} under forced target {forced_target}; stopping");
                break;
            }

            debug!("Summary pass {}/{max_passes} at weight {before}", pass + 1);
            let outcome = summarize(conversation, caller, &options).await?;
            check_cancelled(&ctx.cancel)?;

            let after = estimate(conversation);
            passes.push(PassResult {
                changed: outcome.changed,
                before_weight: before,
                after_weight: after,
                summary_text: outcome.summary_text,
            });
            if !outcome.changed {
                debug!("Summary pass made no change; stopping");
                break;
            }
            summarized = true;
            if after >= before {
                warn!("Summary pass did not reduce weight ({before} -> {after}); stopping");
                break;
            }
        }
        Ok(summarized)
    }

    fn report(
        &self,
        policy: &PassPolicy,
        ctx: &CallContext,
        passes: Vec<PassResult>,
        outcome: &Result<bool>,
    ) {
        let last = passes.last();
        let report = PassReport {
            forced: policy.force,
            threshold: policy.threshold,
            keep_ratio: policy.keep_ratio,
            before_weight: last.map(|p| p.before_weight),
            after_weight: last.map(|p| p.after_weight),
            summarized: matches!(outcome, Ok(true)),
            session_id: ctx.session_id.clone(),
            error: outcome.as_ref().err().map(ToString::to_string),
            at: chrono::Utc::now().to_rfc3339(),
            passes,
        };
        if report.summarized {
            info!(
                "Summary run for {}: {} pass(es), weight {:?} -> {:?}",
                report.session_id,
                report.passes.len(),
                report.passes.first().map(|p| p.before_weight),
                report.after_weight,
            );
        }
        match serde_json::to_value(&report) {
            Ok(payload) => emit(self.telemetry.as_ref(), SUMMARY_RUN_EVENT, &payload),
            Err(e) => warn!("Failed to serialize summary run report: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::session::Conversation;
    use crate::agent::telemetry::FnTelemetry;
    use crate::api::model::{CallFuture, InvokeOptions};
    use crate::testing::ScriptedModel;
    use std::time::Duration;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    type Events = Arc<Mutex<Vec<(String, Value)>>>;

    fn manager(threshold: u64) -> (SummaryPassManager, Events) {
        let events: Events = Arc::default();
        let sink = {
            let events = events.clone();
            FnTelemetry::new(move |event, payload| {
                events.lock().unwrap().push((event.to_string(), payload.clone()));
            })
        };
        let config = CompactionConfig::default().with_threshold(threshold);
        let manager = SummaryPassManager::new(config).with_telemetry(Arc::new(sink));
        (manager, events)
    }

    fn conversation(pairs: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("sys")];
        for i in 0..pairs {
            messages.push(Message::user(format!("{i} {}", "q".repeat(1500))));
            messages.push(Message::assistant_text(format!("{i} {}", "a".repeat(1500))));
        }
        messages
    }

    fn policy(manager: &SummaryPassManager) -> PassPolicy {
        PassPolicy::from_config(manager.config())
    }

    #[tokio::test]
    async fn under_threshold_does_nothing_but_reports() {
        let (manager, events) = manager(1_000_000);
        let mut messages = conversation(4);
        let model = ScriptedModel::new([]);
        let ctx = CallContext::new("m", "s1");

        let summarized = manager
            .run(&mut messages, &model, &policy(&manager), &ctx)
            .await
            .unwrap();

        assert!(!summarized);
        assert!(model.calls().is_empty());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, SUMMARY_RUN_EVENT);
        assert_eq!(events[0].1["summarized"], false);
        assert_eq!(events[0].1["session_id"], "s1");
        assert!(events[0].1["before_weight"].is_null());
    }

    #[tokio::test]
    async fn summarizes_until_under_threshold() {
        let (manager, events) = manager(5_000);
        let mut messages = conversation(10);
        let model = ScriptedModel::new([Ok("short summary".to_string())]);
        let ctx = CallContext::new("m", "s1");

        let summarized = manager
            .run(&mut messages, &model, &policy(&manager), &ctx)
            .await
            .unwrap();

        assert!(summarized);
        assert_eq!(model.calls().len(), 1);
        assert!(estimate(&messages) < 5_000);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["passes"].as_array().unwrap().len(), 1);
        assert_eq!(events[0].1["forced"], false);
    }

    #[tokio::test]
    async fn stops_when_a_pass_does_not_shrink() {
        let (manager, _) = manager(10);
        let mut messages = conversation(10);
        let echo = "z".repeat(200_000);
        let model = ScriptedModel::new([Ok(echo.clone()), Ok(echo.clone()), Ok(echo)]);
        let ctx = CallContext::new("m", "s1");

        let summarized = manager
            .run(&mut messages, &model, &policy(&manager), &ctx)
            .await
            .unwrap();

        assert!(summarized);
        assert_eq!(model.calls().len(), 1);
    }

    #[tokio::test]
    async fn respects_pass_limit() {
        let (manager, events) = manager(10);
        let mut messages = conversation(40);
        let model = ScriptedModel::new([]);
        let ctx = CallContext::new("m", "s1");

        manager
            .run(&mut messages, &model, &policy(&manager), &ctx)
            .await
            .unwrap();

        assert_eq!(model.calls().len(), 3);
        let events = events.lock().unwrap();
        let passes = events[0].1["passes"].as_array().unwrap();
        assert_eq!(passes.len(), 3);
        for pass in passes {
            assert!(pass["after_weight"].as_u64() < pass["before_weight"].as_u64());
        }
    }

    #[tokio::test]
    async fn forced_run_summarizes_below_threshold() {
        let (manager, _) = manager(1_000_000);
        let mut messages = conversation(10);
        let model = ScriptedModel::new([]);
        let ctx = CallContext::new("m", "s1");

        let forced = PassPolicy::forced(manager.config());
        let summarized = manager.run(&mut messages, &model, &forced, &ctx).await.unwrap();

        assert!(summarized);
        // The first pass brings the weight under the forced target.
        assert_eq!(model.calls().len(), 1);
    }

    #[tokio::test]
    async fn forced_target_follows_the_policy_threshold() {
        let (manager, _) = manager(1_000_000);
        let mut messages = conversation(10);
        let model = ScriptedModel::new([]);
        let ctx = CallContext::new("m", "s1");

        let forced = PassPolicy {
            threshold: 100,
            ..PassPolicy::forced(manager.config())
        };
        manager.run(&mut messages, &model, &forced, &ctx).await.unwrap();

        // Under the configured threshold the first pass would be enough.
        assert!(model.calls().len() > 1);
    }

    #[tokio::test]
    async fn uses_configured_summary_model() {
        let config = CompactionConfig::default()
            .with_threshold(10)
            .with_summary_model("cheap");
        let manager = SummaryPassManager::new(config);
        let mut messages = conversation(10);
        let model = ScriptedModel::new([]);
        let ctx = CallContext::new("main", "s1");

        manager
            .run(&mut messages, &model, &PassPolicy::from_config(manager.config()), &ctx)
            .await
            .unwrap();
        assert!(model.calls().iter().all(|c| c.model_id == "cheap"));
    }

    #[tokio::test]
    async fn cancellation_is_reported_once() {
        let (manager, events) = manager(10);
        let mut messages = conversation(10);
        let original = messages.clone();
        let model = ScriptedModel::new([]);
        let ctx = CallContext::new("m", "s1");
        ctx.cancel.cancel();

        let err = manager
            .run(&mut messages, &model, &policy(&manager), &ctx)
            .await
            .unwrap_err();

        assert_eq!(err, ContextError::Cancelled);
        assert_eq!(messages, original);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["error"], "operation cancelled");
    }

    #[tokio::test]
    async fn summarizer_failures_propagate() {
        let (manager, events) = manager(10);
        let mut messages = conversation(10);
        let model = ScriptedModel::new([Err(ModelError::new("upstream down").with_status(503))]);
        let ctx = CallContext::new("m", "s1");

        let err = manager
            .run(&mut messages, &model, &policy(&manager), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ContextError::Model(_)));
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    /// Blocks every call until released.
    struct GatedModel {
        gate: Notify,
        calls: AtomicUsize,
    }

    impl ModelCaller for GatedModel {
        fn invoke<'a>(
            &'a self,
            _model_id: &'a str,
            _messages: &'a [Message],
            _options: &'a InvokeOptions,
        ) -> CallFuture<'a, std::result::Result<String, ModelError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
                Ok("gated summary".to_string())
            })
        }
    }

    #[tokio::test]
    async fn concurrent_runs_for_one_scope_share_a_flight() {
        let (manager, events) = manager(5_000);
        let messages = conversation(10);
        let mut state = Conversation::new("s1", "sys");
        state.messages = messages;
        let session = Arc::new(tokio::sync::Mutex::new(state));
        let model = Arc::new(GatedModel {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let policy = policy(&manager);
        let ctx = CallContext::new("m", "s1");

        let first = {
            let (manager, session, model, ctx) =
                (manager.clone(), session.clone(), model.clone(), ctx.clone());
            tokio::spawn(async move { manager.run_shared("s1", session, model, policy, ctx).await })
        };
        let second = {
            let (manager, session, model, ctx) =
                (manager.clone(), session.clone(), model.clone(), ctx.clone());
            tokio::spawn(async move { manager.run_shared("s1", session, model, policy, ctx).await })
        };

        while model.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        model.gate.notify_one();

        assert_eq!(first.await.unwrap(), Ok(true));
        assert_eq!(second.await.unwrap(), Ok(true));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
        assert!(estimate(&session.lock().await.messages) < 5_000);
    }

    /// Answers every call after a fixed delay.
    struct SlowModel {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ModelCaller for SlowModel {
        fn invoke<'a>(
            &'a self,
            _model_id: &'a str,
            _messages: &'a [Message],
            _options: &'a InvokeOptions,
        ) -> CallFuture<'a, std::result::Result<String, ModelError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                Ok("slow summary".to_string())
            })
        }
    }

    #[tokio::test]
    async fn abandoned_shared_run_finishes_and_releases_the_session() {
        let (manager, events) = manager(5_000);
        let mut state = Conversation::new("s1", "sys");
        state.messages = conversation(10);
        let session = Arc::new(tokio::sync::Mutex::new(state));
        let model = Arc::new(SlowModel {
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
        });
        let ctx = CallContext::new("m", "s1");

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            manager.run_shared("s1", session.clone(), model.clone(), policy(&manager), ctx),
        )
        .await;
        assert!(waited.is_err());

        let state = tokio::time::timeout(Duration::from_secs(5), session.lock())
            .await
            .expect("session lock released once the run finishes");
        assert!(estimate(&state.messages) < 5_000);
        drop(state);

        while manager.flights.is_in_flight("s1") {
            tokio::task::yield_now().await;
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn joiner_cancellation_ends_only_its_own_wait() {
        let (manager, events) = manager(5_000);
        let mut state = Conversation::new("s1", "sys");
        state.messages = conversation(10);
        let session = Arc::new(tokio::sync::Mutex::new(state));
        let model = Arc::new(GatedModel {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let policy = policy(&manager);

        let first = {
            let (manager, session, model) = (manager.clone(), session.clone(), model.clone());
            let ctx = CallContext::new("m", "s1");
            tokio::spawn(async move { manager.run_shared("s1", session, model, policy, ctx).await })
        };
        while model.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let joiner_ctx = CallContext::new("m", "s1");
        let joiner = {
            let (manager, session, model, ctx) =
                (manager.clone(), session.clone(), model.clone(), joiner_ctx.clone());
            tokio::spawn(async move { manager.run_shared("s1", session, model, policy, ctx).await })
        };
        tokio::task::yield_now().await;
        joiner_ctx.cancel.cancel();

        assert_eq!(joiner.await.unwrap(), Err(ContextError::Cancelled));
        assert!(manager.flights.is_in_flight("s1"));

        model.gate.notify_one();
        assert_eq!(first.await.unwrap(), Ok(true));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}
