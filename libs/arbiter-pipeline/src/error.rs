use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the evaluation pipeline.
///
/// Per-case problems (timeouts, runtime errors) never show up here; they become
/// failed verdicts. Only attempt-wide failures do.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("compilation failed: {0}")]
    CompileError(String),

    #[error("sandbox unavailable after {attempts} attempts: {message}")]
    SandboxUnavailable { attempts: u32, message: String },

    #[error("persistence failed after {attempts} attempts: {message}")]
    Persistence { attempts: u32, message: String },

    #[error("submission {0} was cancelled")]
    Cancelled(Uuid),

    #[error("evaluation of submission {0} exceeded the pipeline time limit")]
    PipelineTimeout(Uuid),

    #[error("rate limit exceeded for user {user_id}; retry in {retry_after_secs}s")]
    RateLimited { user_id: String, retry_after_secs: u64 },

    #[error("{0} not found")]
    NotFound(String),

    #[error("stale write for submission {id}: expected version {expected}")]
    VersionConflict { id: Uuid, expected: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the caller should be prompted to try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SandboxUnavailable { .. }
                | PipelineError::Persistence { .. }
                | PipelineError::PipelineTimeout(_)
                | PipelineError::RateLimited { .. }
                | PipelineError::VersionConflict { .. }
        )
    }
}

/// Failure reported by a persistence backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict: expected {expected}")]
    VersionConflict { expected: u64 },

    #[error("record not found: {0}")]
    Missing(String),

    #[error("result already written for {0}")]
    ResultExists(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl StoreError {
    /// Transient backend failures are worth retrying, logical conflicts are not
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let outage = PipelineError::SandboxUnavailable {
            attempts: 3,
            message: "down".into(),
        };
        assert!(outage.is_retryable());
        assert!(PipelineError::Persistence { attempts: 3, message: "io".into() }.is_retryable());
        assert!(!PipelineError::Validation("empty code".into()).is_retryable());
        assert!(!PipelineError::Cancelled(Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::Backend("connection reset".into()).is_transient());
        assert!(!StoreError::VersionConflict { expected: 2 }.is_transient());
    }
}
