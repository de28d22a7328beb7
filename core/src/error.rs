use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Surface-level error taxonomy (spec §7). Every manager operation either
/// succeeds or returns one of these; streaming operations never return an
/// error after emitting `stream_start` — they emit a terminal event instead
/// (see `engine_protocol::event::Event::is_terminal`).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("kernel dead: {0}")]
    KernelDead(String),

    #[error("embedding provider error: {0}")]
    EmbeddingProviderError(String),

    #[error("corrupt offload: {0}")]
    CorruptOffload(String),

    #[error("startup script error: {0}")]
    StartupScriptError(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Maps this error to one of the ten named kinds from spec §7, for
    /// callers (e.g. an external HTTP layer) that need to branch on kind
    /// without matching every transparent variant.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NotFound",
            EngineError::PermissionDenied(_) => "PermissionDenied",
            EngineError::QuotaExceeded(_) => "QuotaExceeded",
            EngineError::InvalidInput(_) => "InvalidInput",
            EngineError::Conflict(_) => "Conflict",
            EngineError::KernelDead(_) => "KernelDead",
            EngineError::EmbeddingProviderError(_) => "EmbeddingProviderError",
            EngineError::CorruptOffload(_) => "CorruptOffload",
            EngineError::StartupScriptError(_) => "StartupScriptError",
            EngineError::Timeout(_) => "Timeout",
            EngineError::Io(_) | EngineError::Json(_) | EngineError::Reqwest(_) => "Io",
            EngineError::TokioJoin(_) => "Io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_maps_named_variants() {
        assert_eq!(EngineError::NotFound("k1".into()).kind(), "NotFound");
        assert_eq!(
            EngineError::PermissionDenied("x".into()).kind(),
            "PermissionDenied"
        );
        assert_eq!(EngineError::Conflict("dup".into()).kind(), "Conflict");
    }

    #[test]
    fn display_includes_context() {
        let err = EngineError::NotFound("t:k1".into());
        assert_eq!(err.to_string(), "not found: t:k1");
    }
}
