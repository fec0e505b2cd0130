use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftnetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Admission gate error: {0}")]
    Gate(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Recovery failed: {0}")]
    Recovery(String),

    /// A hard-stop condition was detected: the run must halt and a human
    /// must intervene. The message carries the detected condition.
    #[error("Hard stop, manual intervention required: {0}")]
    HardStop(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
