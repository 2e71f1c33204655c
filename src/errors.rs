use thiserror::Error;

/// Typed error hierarchy for the proxy.
///
/// Use at module boundaries (router dispatch, upstream calls, config
/// validation, store access). Internal/leaf functions can continue using
/// `anyhow::Result` — the `Internal` variant allows seamless conversion via
/// the `?` operator.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Field is immutable: {field}")]
    ImmutableField { field: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Upstream '{server}' is not ready")]
    UpstreamNotReady { server: String },

    #[error("Upstream '{server}' error: {message}")]
    Upstream { server: String, message: String },

    #[error("Authentication required for '{server}'")]
    AuthRequired { server: String },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using `ProxyError`.
pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Whether a caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::Transient(_) | ProxyError::UpstreamNotReady { .. }
        )
    }

    /// Remediation hint surfaced alongside health events (`""` when none).
    pub fn health_action(&self) -> &'static str {
        match self {
            ProxyError::AuthRequired { .. } | ProxyError::Unauthorized(_) => "login",
            ProxyError::Fatal(_) => "configure",
            _ => "",
        }
    }

    /// HTTP status the (out-of-tree) REST adapter maps this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            ProxyError::Validation(_) | ProxyError::ImmutableField { .. } => 400,
            ProxyError::NotFound(_) => 404,
            ProxyError::Unauthorized(_) | ProxyError::AuthRequired { .. } => 401,
            ProxyError::Forbidden(_) => 403,
            ProxyError::UpstreamNotReady { .. } => 503,
            ProxyError::Upstream { .. } => 502,
            ProxyError::Transient(_) => 503,
            ProxyError::Fatal(_) | ProxyError::Corrupted(_) | ProxyError::Internal(_) => 500,
        }
    }

    /// JSON-RPC error code used in the MCP error envelope.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ProxyError::Validation(_) | ProxyError::ImmutableField { .. } => -32602,
            ProxyError::NotFound(_) => -32601,
            _ => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display() {
        let err = ProxyError::Validation("topK out of range".into());
        assert_eq!(err.to_string(), "Validation error: topK out of range");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn immutable_field_carries_name() {
        let err = ProxyError::ImmutableField {
            field: "name".into(),
        };
        assert!(err.to_string().contains("name"));
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn transient_retryable() {
        assert!(ProxyError::Transient("EOF".into()).is_retryable());
        assert!(
            ProxyError::UpstreamNotReady {
                server: "a".into()
            }
            .is_retryable()
        );
        assert!(!ProxyError::Fatal("no such binary".into()).is_retryable());
    }

    #[test]
    fn auth_required_action() {
        let err = ProxyError::AuthRequired {
            server: "github".into(),
        };
        assert_eq!(err.health_action(), "login");
        assert_eq!(err.http_status(), 401);
    }

    #[test]
    fn internal_from_anyhow() {
        let err: ProxyError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ProxyError::Internal(_)));
        assert_eq!(err.http_status(), 500);
    }
}
