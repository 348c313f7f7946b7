// =============================================================================
// Typed errors for component APIs
// =============================================================================
//
// Components return `CoreError` so callers can branch on the kind; the task
// and binary boundaries wrap everything in `anyhow` with context.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad caller input; safe to surface verbatim.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Entity lookup failed.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Ownership or permission mismatch.
    #[error("access denied: {0}")]
    Forbidden(String),

    /// Illegal state transition or duplicate resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A risk check or cooldown denied the operation.
    #[error("risk denied: {0}")]
    RiskDenied(String),

    /// Venue I/O, cache, or storage hiccup; retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Required configuration missing at startup.
    #[error("fatal init: {0}")]
    FatalInit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Stable machine-readable code for the HTTP boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::RiskDenied(_) => "RISK_DENIED",
            Self::Transient(_) => "TRANSIENT",
            Self::FatalInit(_) => "FATAL_INIT",
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::Json(_) => "JSON",
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::validation("x").code(), "VALIDATION");
        assert_eq!(CoreError::not_found("order", "abc").code(), "NOT_FOUND");
        assert_eq!(CoreError::conflict("dup").code(), "CONFLICT");
    }

    #[test]
    fn not_found_message_names_kind_and_id() {
        let e = CoreError::not_found("order", "o-1");
        assert_eq!(e.to_string(), "order not found: o-1");
    }
}
