use thiserror::Error;

/// Failure of a provider call. Only surfaces from the gateway after the retry
/// budget for transient variants is spent.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network-level failure (connection reset, DNS, TLS).
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// HTTP 401/403.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// HTTP 429.
    #[error("rate limited: retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// HTTP 5xx.
    #[error("server error (HTTP {status}): {body}")]
    ServerError { status: u16, body: String },

    /// HTTP 400/404/422 and friends.
    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// Missing API key or unknown provider id.
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// Empty prompt or out-of-range sampling parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider answered 2xx but the envelope could not be read.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timeout")]
    Timeout,
}

impl ProviderError {
    /// Timeouts, 429, 5xx and network failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RequestFailed(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::ServerError { .. }
                | ProviderError::Timeout
        )
    }

    /// Map an HTTP status + body into the taxonomy above.
    pub fn from_status(status: u16, body: String, retry_after_ms: Option<u64>) -> Self {
        match status {
            401 | 403 => ProviderError::AuthFailed(body),
            404 => ProviderError::ModelNotFound(body),
            408 => ProviderError::Timeout,
            429 => ProviderError::RateLimited {
                retry_after_ms: retry_after_ms.unwrap_or(0),
            },
            500..=599 => ProviderError::ServerError { status, body },
            _ => ProviderError::Rejected { status, body },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = e.status() {
            ProviderError::from_status(status.as_u16(), e.to_string(), None)
        } else {
            ProviderError::RequestFailed(e.to_string())
        }
    }
}

/// A structured completion whose text could not be turned into the object the
/// caller asked for.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("malformed response: {reason}")]
pub struct MalformedResponse {
    pub reason: String,
    pub raw: String,
}

/// Error signals crossing the gateway boundary.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Malformed(#[from] MalformedResponse),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("dataset has no rows")]
    Empty,
    #[error("dataset has no columns")]
    NoColumns,
    #[error("expected column '{column}' not found (available: {available:?})")]
    MissingExpectedColumn {
        column: String,
        available: Vec<String>,
    },
    #[error("prompt references columns not in dataset: {missing:?} (available: {available:?})")]
    UnknownPlaceholders {
        missing: Vec<String>,
        available: Vec<String>,
    },
    #[error("dataset row {line}: {reason}")]
    BadRow { line: usize, reason: String },
    #[error("failed to read dataset {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidStateError {
    #[error("run {0} is not active")]
    NotActive(i64),
    #[error("run {run_id} is not awaiting feedback (phase: {phase})")]
    NotAwaitingFeedback { run_id: i64, phase: String },
    #[error("run {run_id} is {status}, expected {expected}")]
    WrongStatus {
        run_id: i64,
        status: String,
        expected: String,
    },
    #[error("run {0} was already launched")]
    AlreadyLaunched(i64),
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("config error: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited { retry_after_ms: 0 }.is_transient());
        assert!(ProviderError::from_status(503, "busy".into(), None).is_transient());
        assert!(ProviderError::RequestFailed("reset".into()).is_transient());

        assert!(!ProviderError::from_status(401, "nope".into(), None).is_transient());
        assert!(!ProviderError::from_status(400, "bad".into(), None).is_transient());
        assert!(!ProviderError::NotConfigured("key".into()).is_transient());
        assert!(!ProviderError::InvalidRequest("empty prompt".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProviderError::from_status(429, String::new(), Some(1500)),
            ProviderError::RateLimited {
                retry_after_ms: 1500
            }
        );
        assert_eq!(
            ProviderError::from_status(404, "gpt-9".into(), None),
            ProviderError::ModelNotFound("gpt-9".into())
        );
    }

    #[test]
    fn test_config_error_display() {
        let e = ConfigError("unsupported config version 3".into());
        assert_eq!(e.to_string(), "config error: unsupported config version 3");
    }
}
