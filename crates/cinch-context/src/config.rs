//! Tunables for summarization and overflow recovery.
//!
//! [`CompactionConfig`] collects every knob the crate reads. Construct it
//! with [`CompactionConfig::default()`] and the builder methods, deserialize
//! it from a config file (every field has a default), or read the core
//! tunables from the environment with [`CompactionConfig::from_env()`].
//!
//! ```ignore
//! let config = CompactionConfig::from_env()
//!     .with_summary_model("openai/gpt-4o-mini")
//!     .with_summary_mode(SummaryMode::Append);
//! ```

use crate::context::summarizer::SummaryMode;
use serde::Deserialize;
use tracing::warn;

/// Default weight above which summarization passes run.
pub const DEFAULT_THRESHOLD: u64 = 60_000;

/// Default fraction of the conversation weight kept verbatim as the tail.
pub const DEFAULT_KEEP_RATIO: f64 = 0.3;

/// Bounds applied to configured keep ratios.
pub const MIN_KEEP_RATIO: f64 = 0.05;
pub const MAX_KEEP_RATIO: f64 = 0.95;

/// Default byte budget for one summarization digest.
pub const DEFAULT_BYTE_BUDGET: usize = 60_000;

/// Smallest digest byte budget; budget halving never goes below this.
pub const MIN_BYTE_BUDGET: usize = 4_000;

/// Default pass limits for the summary pass manager.
pub const DEFAULT_MAX_PASSES: usize = 3;
pub const DEFAULT_MAX_FORCED_PASSES: usize = 6;

/// Forced runs stop once the weight drops below this fraction of the threshold.
pub const DEFAULT_FORCED_TARGET_FRACTION: f64 = 0.5;

pub const THRESHOLD_ENV: &str = "CINCH_CONTEXT_THRESHOLD";
pub const KEEP_RATIO_ENV: &str = "CINCH_CONTEXT_KEEP_RATIO";
pub const BYTE_BUDGET_ENV: &str = "CINCH_CONTEXT_BYTE_BUDGET";
pub const SUMMARY_MODEL_ENV: &str = "CINCH_CONTEXT_SUMMARY_MODEL";

/// Configuration for summarization and overflow recovery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Weight above which summarization passes run.
    pub threshold: u64,
    /// Fraction of the conversation weight kept verbatim as the tail.
    pub keep_ratio: f64,
    /// Byte budget for one summarization digest.
    pub byte_budget: usize,
    /// Model used for summarization. `None` uses the conversation's model.
    pub summary_model: Option<String>,
    /// System instruction for the summarization request.
    pub system_instruction: Option<String>,
    /// User-turn template; `{{history}}` is replaced with the digest.
    pub template: Option<String>,
    /// Whether a new summary replaces or extends the previous one.
    pub summary_mode: SummaryMode,
    /// Retry the call after a summarization that changed nothing, instead
    /// of going straight to the hard trim.
    pub retry_on_failed_summarize: bool,
    /// Summarize a rejected request even when its estimated weight is under
    /// `threshold`.
    pub force_on_overflow: bool,
    /// Maximum passes for a normal run.
    pub max_passes: usize,
    /// Maximum passes for a forced run.
    pub max_forced_passes: usize,
    /// Forced-run stopping point as a fraction of `threshold`.
    pub forced_target_fraction: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            keep_ratio: DEFAULT_KEEP_RATIO,
            byte_budget: DEFAULT_BYTE_BUDGET,
            summary_model: None,
            system_instruction: None,
            template: None,
            summary_mode: SummaryMode::Replace,
            retry_on_failed_summarize: true,
            force_on_overflow: false,
            max_passes: DEFAULT_MAX_PASSES,
            max_forced_passes: DEFAULT_MAX_FORCED_PASSES,
            forced_target_fraction: DEFAULT_FORCED_TARGET_FRACTION,
        }
    }
}

impl CompactionConfig {
    /// Read the core tunables from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the core tunables through `lookup`. Unset keys keep their
    /// defaults; unparsable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(THRESHOLD_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(v) if v > 0 => config.threshold = v,
                _ => warn!("Ignoring invalid {THRESHOLD_ENV}={raw:?}"),
            }
        }
        if let Some(raw) = lookup(KEEP_RATIO_ENV) {
            match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => config.keep_ratio = v,
                _ => warn!("Ignoring invalid {KEEP_RATIO_ENV}={raw:?}"),
            }
        }
        if let Some(raw) = lookup(BYTE_BUDGET_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(v) => config.byte_budget = v,
                Err(_) => warn!("Ignoring invalid {BYTE_BUDGET_ENV}={raw:?}"),
            }
        }
        if let Some(raw) = lookup(SUMMARY_MODEL_ENV) {
            let model = raw.trim();
            if !model.is_empty() {
                config.summary_model = Some(model.to_string());
            }
        }

        config.normalized()
    }

    /// Clamp values into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.keep_ratio = clamp_keep_ratio(self.keep_ratio);
        self.byte_budget = self.byte_budget.max(MIN_BYTE_BUDGET);
        if !(self.forced_target_fraction > 0.0 && self.forced_target_fraction <= 1.0) {
            self.forced_target_fraction = DEFAULT_FORCED_TARGET_FRACTION;
        }
        self
    }

    /// The weight a forced run against `threshold` aims to get under.
    pub fn forced_target(&self, threshold: u64) -> u64 {
        (threshold as f64 * self.forced_target_fraction) as u64
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_keep_ratio(mut self, ratio: f64) -> Self {
        self.keep_ratio = clamp_keep_ratio(ratio);
        self
    }

    pub fn with_byte_budget(mut self, bytes: usize) -> Self {
        self.byte_budget = bytes.max(MIN_BYTE_BUDGET);
        self
    }

    pub fn with_summary_model(mut self, model: impl Into<String>) -> Self {
        self.summary_model = Some(model.into());
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_summary_mode(mut self, mode: SummaryMode) -> Self {
        self.summary_mode = mode;
        self
    }

    pub fn with_retry_on_failed_summarize(mut self, retry: bool) -> Self {
        self.retry_on_failed_summarize = retry;
        self
    }

    pub fn with_force_on_overflow(mut self, force: bool) -> Self {
        self.force_on_overflow = force;
        self
    }

    pub fn with_max_passes(mut self, normal: usize, forced: usize) -> Self {
        self.max_passes = normal;
        self.max_forced_passes = forced;
        self
    }
}

/// Clamp a configured keep ratio to `[MIN_KEEP_RATIO, MAX_KEEP_RATIO]`.
/// Non-finite input falls back to the default.
pub fn clamp_keep_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(MIN_KEEP_RATIO, MAX_KEEP_RATIO)
    } else {
        DEFAULT_KEEP_RATIO
    }
}
