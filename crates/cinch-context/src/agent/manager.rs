//! [`ContextManager`]: one handle over every context-management operation.
//!
//! Holds the configuration, the error classifier, the telemetry sink, the
//! id generator and the summary pass manager, and wires them into the
//! individual operations. [`ContextManager::call_model`] is the complete
//! guarded call most callers want:
//!
//! 1. tool-call repair if the conversation is invalid;
//! 2. the model call under the recovery orchestrator (summarize, then hard
//!    trim);
//! 3. on a protocol-mismatch rejection, one repair-and-retry.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use super::ids::IdGenerator;
use super::session::{CallContext, Session};
use super::telemetry::{
    CONTEXT_ERROR_EVENT, HARD_TRIM_EVENT, NoopTelemetry, REPAIR_EVENT, TelemetrySink, emit,
};
use crate::api::classify::{DefaultClassifier, ErrorClassifier};
use crate::api::model::{CallFuture, InvokeOptions, ModelCaller};
use crate::api::recovery::{RecoverableCall, RecoveryPolicy, RecoveryStage, recover_and_run};
use crate::config::CompactionConfig;
use crate::context::budget::{ContextUsage, estimate, estimate_message};
use crate::context::passes::{PassPolicy, SummaryPassManager};
use crate::context::repair::{PendingMode, RepairOptions, RepairOutcome, repair, validate};
use crate::context::summarizer::{SummarizeOptions, SummarizeOutcome, summarize};
use crate::context::tail::select_tail_start;
use crate::context::trim::{TrimOutcome, hard_trim};
use crate::{ContextError, Message, ModelError, Result};

/// Entry point for context management.
#[derive(Clone)]
pub struct ContextManager {
    config: CompactionConfig,
    classifier: Arc<dyn ErrorClassifier>,
    telemetry: Arc<dyn TelemetrySink>,
    ids: Option<Arc<dyn IdGenerator>>,
    passes: SummaryPassManager,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(CompactionConfig::default())
    }
}

impl ContextManager {
    pub fn new(config: CompactionConfig) -> Self {
        let config = config.normalized();
        Self {
            passes: SummaryPassManager::new(config.clone()),
            config,
            classifier: Arc::new(DefaultClassifier),
            telemetry: Arc::new(NoopTelemetry),
            ids: None,
        }
    }

    /// A manager configured from `CINCH_CONTEXT_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(CompactionConfig::from_env())
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.passes = self.passes.with_classifier(Arc::clone(&classifier));
        self.classifier = classifier;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.passes = self.passes.with_telemetry(Arc::clone(&telemetry));
        self.telemetry = telemetry;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// The policy for a normal (non-forced) pass run.
    pub fn pass_policy(&self) -> PassPolicy {
        PassPolicy::from_config(&self.config)
    }

    // ── Measurement ────────────────────────────────────────────────

    pub fn estimate(&self, messages: &[Message]) -> u64 {
        estimate(messages)
    }

    pub fn usage(&self, messages: &[Message]) -> ContextUsage {
        ContextUsage::measure(messages, self.config.threshold)
    }

    /// Tail split for `messages` at the configured keep ratio.
    pub fn select_tail_start(&self, messages: &[Message]) -> Option<usize> {
        select_tail_start(messages, self.config.keep_ratio, estimate_message)
    }

    // ── Repair ─────────────────────────────────────────────────────

    pub fn repair_options(&self, mode: PendingMode) -> RepairOptions {
        let options = RepairOptions::new(mode);
        match &self.ids {
            Some(ids) => options.with_id_generator(Arc::clone(ids)),
            None => options,
        }
    }

    pub fn repair(&self, messages: &[Message], mode: PendingMode) -> RepairOutcome {
        repair(messages, &self.repair_options(mode))
    }

    /// Repair the session's conversation in place. Returns whether it
    /// changed; an unchanged conversation is not rewritten.
    pub fn repair_session<S: Session + ?Sized>(&self, session: &mut S, mode: PendingMode) -> bool {
        self.rewrite_session(session, &self.repair_options(mode))
    }

    fn rewrite_session<S: Session + ?Sized>(&self, session: &mut S, options: &RepairOptions) -> bool {
        let outcome = repair(session.messages(), options);
        if outcome.changed {
            *session.messages_mut() = outcome.messages;
        }
        outcome.changed
    }

    // ── Summarization ──────────────────────────────────────────────

    pub fn summarize_options(&self, ctx: &CallContext) -> SummarizeOptions {
        SummarizeOptions::from_config(&self.config, &ctx.model_id)
            .with_classifier(Arc::clone(&self.classifier))
            .with_cancel(ctx.cancel.clone())
    }

    /// One summarization call over `conversation`.
    pub async fn summarize(
        &self,
        conversation: &mut Vec<Message>,
        caller: &dyn ModelCaller,
        ctx: &CallContext,
    ) -> Result<SummarizeOutcome> {
        summarize(conversation, caller, &self.summarize_options(ctx)).await
    }

    /// Summarize until `conversation` fits `policy`.
    pub async fn run_passes(
        &self,
        conversation: &mut Vec<Message>,
        caller: &dyn ModelCaller,
        policy: &PassPolicy,
        ctx: &CallContext,
    ) -> Result<bool> {
        self.passes.run(conversation, caller, policy, ctx).await
    }

    /// [`run_passes`](Self::run_passes) with concurrent calls for the same
    /// session collapsed into one run.
    pub async fn run_passes_shared<S>(
        &self,
        session: Arc<tokio::sync::Mutex<S>>,
        caller: Arc<dyn ModelCaller>,
        policy: PassPolicy,
        ctx: CallContext,
    ) -> Result<bool>
    where
        S: Session + 'static,
    {
        let scope = ctx.session_id.clone();
        self.passes
            .run_shared(&scope, session, caller, policy, ctx)
            .await
    }

    // ── Fallback and recovery ──────────────────────────────────────

    /// Hard-trim the session and report it.
    pub fn hard_trim<S: Session + ?Sized>(&self, session: &mut S, session_id: &str) -> TrimOutcome {
        let outcome = hard_trim(session);
        emit(
            self.telemetry.as_ref(),
            HARD_TRIM_EVENT,
            &json!({
                "session_id": session_id,
                "before": outcome.before,
                "after": outcome.after,
                "kept_user": outcome.kept_user,
            }),
        );
        outcome
    }

    /// Run `target` under the recovery orchestrator with this manager's
    /// classifier and policy.
    pub async fn recover_and_run<C>(
        &self,
        target: &mut C,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<C::Output>
    where
        C: RecoverableCall + ?Sized,
    {
        let policy = RecoveryPolicy::from_config(&self.config);
        recover_and_run(target, self.classifier.as_ref(), policy, cancel).await
    }

    /// Call the model on the session's conversation with repair and
    /// overflow recovery.
    pub async fn call_model<S>(
        &self,
        session: &mut S,
        caller: &dyn ModelCaller,
        ctx: &CallContext,
    ) -> Result<String>
    where
        S: Session + ?Sized,
    {
        if let Err(err) = validate(session.messages()) {
            debug!("Repairing before call: {err}");
            self.repair_session(session, PendingMode::Strip);
        }

        let detail = match self.guarded_call(session, caller, ctx).await {
            Err(ContextError::ProtocolMismatch(detail)) => detail,
            other => return other,
        };

        // After a rejection, ids reused across turns are rewritten too.
        let options = self
            .repair_options(PendingMode::Drop)
            .with_dedupe_across_turns(true);
        if !self.rewrite_session(session, &options) {
            warn!("Model rejected the tool-call sequence but repair changed nothing: {detail}");
            return Err(ContextError::ProtocolMismatch(detail));
        }
        info!("Model rejected the tool-call sequence; retrying after repair");
        emit(
            self.telemetry.as_ref(),
            REPAIR_EVENT,
            &json!({ "session_id": ctx.session_id, "detail": detail }),
        );
        self.guarded_call(session, caller, ctx).await
    }

    async fn guarded_call<S>(
        &self,
        session: &mut S,
        caller: &dyn ModelCaller,
        ctx: &CallContext,
    ) -> Result<String>
    where
        S: Session + ?Sized,
    {
        let mut call = SessionCall {
            manager: self,
            session,
            caller,
            ctx,
            options: InvokeOptions::new(ctx.cancel.clone()).with_stream(ctx.stream),
        };
        self.recover_and_run(&mut call, &ctx.cancel).await
    }
}

/// A model call over a session, recovered by summarizing and trimming that
/// same session.
struct SessionCall<'a, S: ?Sized> {
    manager: &'a ContextManager,
    session: &'a mut S,
    caller: &'a dyn ModelCaller,
    ctx: &'a CallContext,
    options: InvokeOptions,
}

impl<S> RecoverableCall for SessionCall<'_, S>
where
    S: Session + ?Sized,
{
    type Output = String;

    fn run(&mut self) -> CallFuture<'_, std::result::Result<String, ModelError>> {
        self.caller
            .invoke(&self.ctx.model_id, self.session.messages(), &self.options)
    }

    fn summarize(&mut self) -> CallFuture<'_, Result<bool>> {
        Box::pin(async move {
            let config = self.manager.config();
            let policy = if config.force_on_overflow {
                PassPolicy::forced(config)
            } else {
                PassPolicy::from_config(config)
            };
            self.manager
                .run_passes(self.session.messages_mut(), self.caller, &policy, self.ctx)
                .await
        })
    }

    fn hard_trim(&mut self) {
        self.manager.hard_trim(self.session, &self.ctx.session_id);
    }

    fn on_context_error(&mut self, err: &ContextError, stage: RecoveryStage) {
        emit(
            self.manager.telemetry.as_ref(),
            CONTEXT_ERROR_EVENT,
            &json!({
                "session_id": self.ctx.session_id,
                "stage": format!("{stage:?}"),
                "error": err.to_string(),
                "weight": estimate(self.session.messages()),
            }),
        );
    }
}
