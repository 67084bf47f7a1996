//! Context-recovery orchestrator.
//!
//! Wraps one logical model call. When the model rejects the request as too
//! large, recovery escalates in two stages:
//!
//! 1. summarize, then retry;
//! 2. hard-trim, then retry one final time and return whatever happens.
//!
//! Failures that are not "context too large" propagate immediately at any
//! stage. Cancellation is checked at every transition and wins over any
//! result a recovery step already produced.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::classify::{ErrorClassifier, classify_model_error};
use super::model::CallFuture;
use crate::config::CompactionConfig;
use crate::error::check_cancelled;
use crate::{ContextError, ModelError, Result};

/// Which attempt produced a context error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    /// The first attempt; summarization comes next.
    Initial,
    /// The retry after summarization; a hard trim comes next.
    AfterSummarize,
}

/// Recovery knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Retry after a summarization that changed nothing. When false, such a
    /// run goes straight to the hard trim.
    pub retry_on_failed_summarize: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            retry_on_failed_summarize: true,
        }
    }
}

impl RecoveryPolicy {
    pub fn from_config(config: &CompactionConfig) -> Self {
        Self {
            retry_on_failed_summarize: config.retry_on_failed_summarize,
        }
    }
}

/// A model call that can be retried after shrinking its input.
///
/// Implementors own (or borrow) the conversation: `summarize` and
/// `hard_trim` shrink it, and the next `run` sends the smaller version.
pub trait RecoverableCall: Send {
    type Output: Send;

    /// Make the model call.
    fn run(&mut self) -> CallFuture<'_, std::result::Result<Self::Output, ModelError>>;

    /// Summarize the conversation. Returns whether anything changed.
    fn summarize(&mut self) -> CallFuture<'_, Result<bool>>;

    /// Replace the conversation with its hard-trimmed form.
    fn hard_trim(&mut self);

    /// Observe a recoverable failure before recovery starts (e.g. to show an
    /// "about to summarize" notice).
    fn on_context_error(&mut self, err: &ContextError, stage: RecoveryStage) {
        let _ = (err, stage);
    }
}

async fn attempt<C>(target: &mut C, classifier: &dyn ErrorClassifier) -> Result<C::Output>
where
    C: RecoverableCall + ?Sized,
{
    target
        .run()
        .await
        .map_err(|err| classify_model_error(classifier, err))
}

/// Run `target`, recovering from "context too large" failures.
pub async fn recover_and_run<C>(
    target: &mut C,
    classifier: &dyn ErrorClassifier,
    policy: RecoveryPolicy,
    cancel: &CancellationToken,
) -> Result<C::Output>
where
    C: RecoverableCall + ?Sized,
{
    let err = match attempt(target, classifier).await {
        Ok(output) => return Ok(output),
        Err(err) if err.is_context_too_large() => err,
        Err(err) => return Err(err),
    };

    info!("Request too large ({err}); summarizing before retry");
    target.on_context_error(&err, RecoveryStage::Initial);
    check_cancelled(cancel)?;
    let summarized = target.summarize().await?;
    check_cancelled(cancel)?;

    if !summarized && !policy.retry_on_failed_summarize {
        warn!("Summarization made no progress; hard-trimming before final attempt");
        target.hard_trim();
        check_cancelled(cancel)?;
        return attempt(target, classifier).await;
    }

    debug!("Retrying after summarization (changed: {summarized})");
    let err = match attempt(target, classifier).await {
        Ok(output) => return Ok(output),
        Err(err) if err.is_context_too_large() => err,
        Err(err) => return Err(err),
    };

    warn!("Request still too large after summarization ({err}); hard-trimming");
    target.on_context_error(&err, RecoveryStage::AfterSummarize);
    check_cancelled(cancel)?;
    target.hard_trim();
    check_cancelled(cancel)?;
    attempt(target, classifier).await
}
