//! Error types for Tideline

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum TlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),

    #[error("Invalid timecode: {0}")]
    InvalidTimecode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias
pub type TlResult<T> = Result<T, TlError>;
