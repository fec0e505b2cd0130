use thiserror::Error;

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Malformed response envelope: {0}")]
    Envelope(String),
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        ControlPlaneError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for ControlPlaneError {
    fn from(err: serde_json::Error) -> Self {
        ControlPlaneError::Parse(err.to_string())
    }
}
