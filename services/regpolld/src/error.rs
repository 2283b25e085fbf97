//! Service error types

use regpoll_core::RegisterError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration could not be read or merged
    #[error("Failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    /// Configuration loaded but is not usable
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

impl ServiceError {
    pub fn config(msg: impl Into<String>) -> Self {
        ServiceError::Config(msg.into())
    }
}
