use std::time::Duration;

/// Typed error hierarchy for external collaborator calls.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    // Fatal
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),

    // Operational
    #[error("malformed agent output: {0}")]
    Malformed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Api { .. } | Self::Network(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InvalidRequest(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Api { .. } => "api_error",
            Self::Network(_) => "network",
            Self::Malformed(_) => "malformed",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            400 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Api { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(Duration::from_secs(30))
        } else {
            Self::Network(e.to_string())
        }
    }
}
