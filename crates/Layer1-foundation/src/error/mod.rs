//! Error types for DeepCtx
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// DeepCtx 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 컨텍스트 관련
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Workspace unavailable: {0}")]
    NamespaceGone(String),

    #[error("No content to compress")]
    NoContentToCompress,

    #[error("Token budget {budget} is smaller than the smallest item ({smallest} tokens)")]
    BudgetTooSmall { budget: usize, smallest: usize },

    #[error("External collaborator timed out: {0}")]
    ExternalTimeout(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // ========================================================================
    // 체크포인트 관련
    // ========================================================================
    #[error("Checkpoint failed, operation aborted: {0}")]
    CheckpointFailed(String),

    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // ========================================================================
    // 실행 관련
    // ========================================================================
    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 로컬에서 복구 가능한 에러인지 확인 (호출자는 빈 결과로 취급)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::BudgetTooSmall { .. })
    }

    /// 사용자에게 보여줄 수 있는 에러인지 확인
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::NamespaceGone(_)
                | Error::NoContentToCompress
                | Error::CheckpointFailed(_)
                | Error::Conflict(_)
                | Error::InvalidInput(_)
                | Error::Storage(_)
                | Error::Cancelled
        )
    }

    /// Stable machine-readable code used in protocol error responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::NamespaceGone(_) => "namespace_gone",
            Error::NoContentToCompress => "no_content_to_compress",
            Error::BudgetTooSmall { .. } => "budget_too_small",
            Error::ExternalTimeout(_) => "external_timeout",
            Error::Conflict(_) => "conflict",
            Error::CheckpointFailed(_) => "checkpoint_failed",
            Error::Config(_) => "config",
            Error::Storage(_) | Error::Io(_) | Error::Sqlite(_) => "storage",
            Error::Cancelled => "cancelled",
            Error::InvalidInput(_) => "invalid_input",
            Error::Json(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }

    /// NotFound 에러 생성 헬퍼
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{} '{}'", kind, id))
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::NamespaceGone("w".into()).code(), "namespace_gone");
        assert_eq!(Error::NoContentToCompress.code(), "no_content_to_compress");
        assert_eq!(Error::Storage("x".into()).code(), "storage");
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::not_found("item", "abc").is_recoverable());
        assert!(!Error::NamespaceGone("w".into()).is_recoverable());
        assert!(Error::NamespaceGone("w".into()).is_user_facing());
    }
}
