use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("inference error: {0}")]
    Inference(String),

    /// Execution provider or device could not be acquired
    #[error("device error: {0}")]
    Device(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The stream was stopped or reloaded while the cycle was pending
    #[error("cycle cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),
}
