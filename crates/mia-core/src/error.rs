use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiaError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MiaError {
    /// Short error code string, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            MiaError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MiaError>;
