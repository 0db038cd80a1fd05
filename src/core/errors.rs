// src/core/errors.rs

//! Defines the primary error type for the supervisor core.

use std::sync::Arc;
use thiserror::Error;

use crate::core::dcs::DcsError;

/// The main error enum, representing all possible failures within the control loop
/// and its collaborators. `thiserror` gives us clean `Display` impls and `From`
/// conversions for the handful of library errors this crate actually touches.
#[derive(Error, Debug, Clone)]
pub enum SupervisorError {
    #[error("DCS error: {0}")]
    Dcs(#[from] DcsError),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("database connection error: {0}")]
    PostgresConnection(String),

    #[error("retryable operation exhausted its budget: {0}")]
    RetryFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("process manager error: {0}")]
    Process(String),

    #[error("parameter validation error: {0}")]
    Validation(String),
}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        SupervisorError::Io(Arc::new(e))
    }
}

impl From<toml::de::Error> for SupervisorError {
    fn from(e: toml::de::Error) -> Self {
        SupervisorError::Config(e.to_string())
    }
}
