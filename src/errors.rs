use thiserror::Error;

use crate::providers::{ProviderError, ProviderErrorKind};

/// Crate-wide error taxonomy.
///
/// The variants map one-to-one onto the pipeline's recovery policies:
/// provider errors carry a retry class, `Data` means the model returned
/// something we could not parse (each caller decides whether to retry,
/// accept empty, or flag a single row), and `Fatal` aborts the audit with a
/// human-readable message.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("malformed model output: {0}")]
    Data(String),

    #[error("{0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error should end the audit in `failed` rather than being
    /// absorbed by the current phase.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Fatal(_) | EngineError::Database(_) | EngineError::Internal(_) => true,
            EngineError::Provider(e) => e.kind == ProviderErrorKind::Permanent,
            EngineError::Data(_) => false,
            EngineError::Redis(_) => false,
        }
    }

    /// Message persisted to `audits.error_message` on failure.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Database(e) => {
                tracing::error!("database error: {e}");
                "database unavailable".to_string()
            }
            EngineError::Internal(e) => {
                tracing::error!("internal error: {e}");
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;

    #[test]
    fn permanent_provider_errors_are_fatal() {
        let e = EngineError::from(ProviderError::permanent("bad request"));
        assert!(e.is_fatal());
    }

    #[test]
    fn transient_provider_errors_are_not_fatal() {
        let e = EngineError::from(ProviderError::transient("503 from upstream"));
        assert!(!e.is_fatal());
        let e = EngineError::from(ProviderError::quota("billing limit"));
        assert!(!e.is_fatal());
    }

    #[test]
    fn data_errors_are_caller_policy() {
        assert!(!EngineError::Data("unexpected shape".into()).is_fatal());
    }

    #[test]
    fn fatal_keeps_its_message() {
        let e = EngineError::Fatal("query generation produced 5 of 48 queries".into());
        assert!(e.is_fatal());
        assert_eq!(e.user_message(), "query generation produced 5 of 48 queries");
    }
}
