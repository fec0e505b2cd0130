use thiserror::Error;

pub type Result<T> = std::result::Result<T, PermitError>;

#[derive(Debug, Error)]
pub enum PermitError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    /// Hard denial from the gate (or the local repeat guard). Not retryable;
    /// `suggested_actions` carries the server's remediation hints.
    #[error("Permit denied ({code}): {message}")]
    Denied {
        code: String,
        message: String,
        suggested_actions: Vec<String>,
    },

    /// The wait loop exceeded its bound without a grant. Distinct from a
    /// denial: the gate never said no, we just ran out of patience.
    #[error("Timed out waiting for permit after {waited_ms}ms")]
    Timeout { waited_ms: u64 },
}

impl From<reqwest::Error> for PermitError {
    fn from(err: reqwest::Error) -> Self {
        PermitError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PermitError {
    fn from(err: serde_json::Error) -> Self {
        PermitError::Parse(err.to_string())
    }
}
