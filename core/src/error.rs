use serde::{Deserialize, Serialize};

/// Closed set of error kinds shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Auth,
    RateLimit,
    Timeout,
    Network,
    ExternalService,
    Database,
    Internal,
}

impl ErrorKind {
    /// Kinds that are safe to retry without caller intervention.
    /// Contract errors (validation, auth, not_found, conflict) must never be retried.
    pub fn retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalService
                | ErrorKind::Database
                | ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::RateLimit
        )
    }

    /// Suggested HTTP status for the error envelope.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Auth => 401,
            ErrorKind::RateLimit => 429,
            ErrorKind::Timeout => 504,
            ErrorKind::Network => 502,
            ErrorKind::ExternalService => 502,
            ErrorKind::Database => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Database => "database",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// The error type every outward-facing operation returns.
///
/// Carries a kind from the closed taxonomy, a stable machine code, a human
/// message, an optional wrapped cause, and a retryable flag. Module-local
/// error enums convert into this at crate seams.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub retryable: bool,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            cause: None,
            retryable: kind.retryable_by_default(),
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, code, message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, code, message)
    }

    pub fn external(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, code, message)
    }

    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, code, message)
    }

    /// Operation aborted because the caller's cancellation token fired.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Timeout, "CANCELLED", "operation cancelled").with_retryable(false)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_defaults_follow_the_taxonomy() {
        for kind in [
            ErrorKind::ExternalService,
            ErrorKind::Database,
            ErrorKind::Network,
            ErrorKind::Timeout,
            ErrorKind::RateLimit,
        ] {
            assert!(kind.retryable_by_default(), "{kind} should be retryable");
        }
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Auth,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Internal,
        ] {
            assert!(!kind.retryable_by_default(), "{kind} must not be retryable");
        }
    }

    #[test]
    fn error_carries_code_and_status() {
        let err = GatewayError::validation("CYCLIC_MOVE", "move would create a cycle");
        assert_eq!(err.code, "CYCLIC_MOVE");
        assert_eq!(err.http_status(), 400);
        assert!(!err.retryable);

        let err = GatewayError::timeout("DEADLINE_EXCEEDED", "read deadline exceeded");
        assert_eq!(err.http_status(), 504);
        assert!(err.retryable);
    }

    #[test]
    fn cancelled_is_never_retryable() {
        assert!(!GatewayError::cancelled().retryable);
    }
}
