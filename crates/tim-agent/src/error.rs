use thiserror::Error;

/// Errors surfaced by prompt operations across every channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PromptError {
    #[error("Prompt request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("{0}")]
    ConnectionClosed(String),
    #[error("{0}")]
    Remote(String),
    #[error("prompt aborted")]
    Aborted,
    #[error("{0}")]
    Backend(String),
}

/// Caller-facing classifier: true for the expected timeout/abort outcomes,
/// false for transport failures and remote rejections.
pub fn is_prompt_timeout_error(err: &PromptError) -> bool {
    matches!(err, PromptError::Timeout { .. } | PromptError::Aborted)
}
