//! The model-facing side: how models are called, how their failures are
//! classified, and how a call recovers from "context too large".
//!
//! - [`model`]: the [`ModelCaller`] contract and [`InvokeOptions`].
//! - [`classify`]: [`ErrorClassifier`] and the status/code/text heuristics
//!   of [`DefaultClassifier`].
//! - [`recovery`]: [`recover_and_run`]: summarize, then hard-trim, then
//!   give up.

pub mod classify;
pub mod model;
pub mod recovery;

// Re-export commonly used items at the module level.
pub use classify::{DefaultClassifier, ErrorClassifier, classify_model_error};
pub use model::{CallFuture, InvokeOptions, ModelCaller};
pub use recovery::{RecoverableCall, RecoveryPolicy, RecoveryStage, recover_and_run};
