//! Failure classification.
//!
//! Providers report "your request is too large" in many shapes: an HTTP
//! 413, a machine-readable code like `context_length_exceeded`, or only free
//! text, sometimes localized. Matching is heuristic and never exhaustive, so
//! the classifier is a trait: callers can swap in their own or wrap
//! [`DefaultClassifier`]. Anything unrecognized is
//! [`ErrorKind::Unclassified`] and is propagated, never recovered.

use crate::{ContextError, ErrorKind, ModelError};

/// Sorts a [`ModelError`] into an [`ErrorKind`].
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &ModelError) -> ErrorKind;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&ModelError) -> ErrorKind + Send + Sync,
{
    fn classify(&self, err: &ModelError) -> ErrorKind {
        self(err)
    }
}

/// Classify `err` and wrap it as a [`ContextError`].
pub fn classify_model_error(classifier: &dyn ErrorClassifier, err: ModelError) -> ContextError {
    let kind = classifier.classify(&err);
    ContextError::from_kind(kind, err)
}

/// Codes and types providers use for oversized requests.
const CONTEXT_CODES: &[&str] = &[
    "context_length_exceeded",
    "context_too_long",
    "request_too_large",
    "string_above_max_length",
    "max_tokens_exceeded",
    "prompt_too_long",
    "tokens_exceeded",
];

/// Free-text phrasing of oversized requests, matched case-insensitively.
const CONTEXT_PATTERNS: &[&str] = &[
    // English
    "context length",
    "context window",
    "context_length",
    "maximum context",
    "prompt is too long",
    "input is too long",
    "request too large",
    "request entity too large",
    "payload too large",
    "too many tokens",
    "reduce the length",
    "exceeds the maximum",
    "token limit",
    "input length",
    // Chinese
    "上下文长度",
    "上下文过长",
    "超出最大",
    "超过最大",
    "输入过长",
    "请求过大",
    // Japanese
    "コンテキスト長",
    "コンテキストの長さ",
    "トークン数が上限",
    "入力が長すぎ",
    // Korean
    "컨텍스트 길이",
    "최대 컨텍스트",
    "입력이 너무 깁니다",
    "토큰 한도",
    // Spanish
    "longitud del contexto",
    "límite de contexto",
    "demasiado largo",
    "demasiados tokens",
    // German
    "kontextlänge",
    "kontextfenster",
    "zu lang",
    "zu viele tokens",
    // French
    "longueur du contexte",
    "fenêtre de contexte",
    "trop long",
    "trop de jetons",
    // Russian
    "длина контекста",
    "контекстного окна",
    "слишком длин",
    "слишком много токенов",
];

/// Phrasing of rejected tool-call / tool-result sequences.
const PROTOCOL_PATTERNS: &[&str] = &[
    "tool_call_id",
    "tool_use_id",
    "tool_use.id",
    "tool_result",
    "must be followed by tool messages",
    "must be a response to a preceding message with 'tool_calls'",
    "tool call id",
    "unexpected tool",
    "does not have a corresponding tool",
];

/// Rate-limit phrasing that must never be read as "too large".
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "tokens per min",
    "requests per min",
    "quota",
];

/// Status, code and multilingual text heuristics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &ModelError) -> ErrorKind {
        if err.cancelled {
            return ErrorKind::Cancelled;
        }
        if err.status == Some(413) {
            return ErrorKind::ContextTooLarge;
        }

        let code = err.code.as_deref().unwrap_or_default().to_lowercase();
        let error_type = err.error_type.as_deref().unwrap_or_default().to_lowercase();
        if CONTEXT_CODES
            .iter()
            .any(|c| code == *c || error_type == *c)
        {
            return ErrorKind::ContextTooLarge;
        }

        let lower = err.message.to_lowercase();
        // "Too many tokens per minute" is a 429, not an oversized request.
        if err.status == Some(429) || contains_any(&lower, RATE_LIMIT_PATTERNS) {
            return ErrorKind::Unclassified;
        }
        if contains_any(&lower, CONTEXT_PATTERNS) {
            return ErrorKind::ContextTooLarge;
        }
        if contains_any(&lower, PROTOCOL_PATTERNS) {
            return ErrorKind::ProtocolMismatch;
        }
        ErrorKind::Unclassified
    }
}

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(err: ModelError) -> ErrorKind {
        DefaultClassifier.classify(&err)
    }

    #[test]
    fn status_413_is_too_large() {
        assert_eq!(
            classify(ModelError::new("Payload rejected").with_status(413)),
            ErrorKind::ContextTooLarge
        );
    }

    #[test]
    fn machine_readable_codes() {
        assert_eq!(
            classify(ModelError::new("bad request").with_code("context_length_exceeded")),
            ErrorKind::ContextTooLarge
        );
        assert_eq!(
            classify(ModelError::new("bad request").with_type("request_too_large")),
            ErrorKind::ContextTooLarge
        );
    }

    #[test]
    fn english_text() {
        let err = ModelError::new(
            "This model's maximum context length is 128000 tokens. However, your messages resulted in 140000 tokens.",
        )
        .with_status(400);
        assert_eq!(classify(err), ErrorKind::ContextTooLarge);
        assert_eq!(
            classify(ModelError::new("prompt is too long: 210000 tokens > 200000 maximum")),
            ErrorKind::ContextTooLarge
        );
    }

    #[test]
    fn localized_text() {
        for message in [
            "请求失败：上下文长度超出模型限制",
            "コンテキスト長の上限を超えました",
            "최대 컨텍스트 길이를 초과했습니다",
            "La longitud del contexto excede el máximo",
            "Die Kontextlänge überschreitet das Limit",
            "La longueur du contexte dépasse la limite",
            "Превышена длина контекста модели",
        ] {
            assert_eq!(classify(ModelError::new(message)), ErrorKind::ContextTooLarge, "{message}");
        }
    }

    #[test]
    fn rate_limits_are_not_too_large() {
        assert_eq!(
            classify(ModelError::new("Rate limit reached for tokens per min").with_status(429)),
            ErrorKind::Unclassified
        );
        assert_eq!(
            classify(ModelError::new("too many tokens in flight").with_status(429)),
            ErrorKind::Unclassified
        );
    }

    #[test]
    fn dangling_tool_calls_are_protocol_mismatches() {
        let err = ModelError::new(
            "An assistant message with 'tool_calls' must be followed by tool messages responding to each 'tool_call_id'.",
        )
        .with_status(400);
        assert_eq!(classify(err), ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn cancellation_and_unknowns() {
        assert_eq!(classify(ModelError::cancelled()), ErrorKind::Cancelled);
        assert_eq!(
            classify(ModelError::new("internal server error").with_status(500)),
            ErrorKind::Unclassified
        );
    }

    #[test]
    fn closures_are_classifiers() {
        let always_large = |_: &ModelError| ErrorKind::ContextTooLarge;
        let err = classify_model_error(&always_large, ModelError::new("anything"));
        assert!(err.is_context_too_large());
    }
}
