use thiserror::Error;

pub type Result<T, E = EdgecamError> = std::result::Result<T, E>;

/// Unified error type covering common failure scenarios across subsystems.
#[derive(Debug, Error)]
pub enum EdgecamError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("missing configuration: {0}")]
    ConfigMissing(&'static str),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("vision error: {0}")]
    Vision(String),
    #[error("twin parse error: {0}")]
    TwinParse(String),
    #[error("upload error: {0}")]
    Upload(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
