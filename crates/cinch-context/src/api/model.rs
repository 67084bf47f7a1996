//! The model-calling contract.
//!
//! The crate never talks to a model itself. Callers implement
//! [`ModelCaller`] over whatever client they use (HTTP, a local runtime, a
//! scripted double in tests) and hand it to the summarizer and the recovery
//! orchestrator.

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::{Message, ModelError};

/// Boxed future returned by the dyn-compatible traits in this crate.
pub type CallFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-call options passed to [`ModelCaller::invoke`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Stream the response. Irrelevant to context management; passed through
    /// from [`CallContext::stream`](crate::agent::session::CallContext::stream)
    /// and never set on summary requests.
    pub stream: bool,
    /// Send no tool definitions. The summarizer always sets this so the
    /// summary request can never produce tool calls.
    pub disable_tools: bool,
    /// Cooperative cancellation signal. Implementations should fail with
    /// [`ModelError::cancelled()`] once it fires.
    pub cancel: CancellationToken,
}

impl InvokeOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    /// Options for a single-pass, tool-free request.
    pub fn without_tools(cancel: CancellationToken) -> Self {
        Self {
            disable_tools: true,
            ..Self::new(cancel)
        }
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

/// A model that turns a message list into reply text.
///
/// Uses a boxed future so the trait is dyn-compatible.
///
/// ```ignore
/// struct MyModel { client: OpenRouterClient }
///
/// impl ModelCaller for MyModel {
///     fn invoke<'a>(
///         &'a self,
///         model_id: &'a str,
///         messages: &'a [Message],
///         options: &'a InvokeOptions,
///     ) -> CallFuture<'a, Result<String, ModelError>> {
///         Box::pin(async move {
///             let reply = self.client.chat(model_id, messages).await
///                 .map_err(|e| ModelError::new(e.to_string()))?;
///             Ok(reply.content.unwrap_or_default())
///         })
///     }
/// }
/// ```
pub trait ModelCaller: Send + Sync {
    fn invoke<'a>(
        &'a self,
        model_id: &'a str,
        messages: &'a [Message],
        options: &'a InvokeOptions,
    ) -> CallFuture<'a, Result<String, ModelError>>;
}
