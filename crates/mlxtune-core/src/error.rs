//! Error types for mlxtune.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for mlxtune operations.
pub type Result<T> = std::result::Result<T, MlxTuneError>;

/// Main error type for mlxtune operations.
#[derive(Error, Debug)]
pub enum MlxTuneError {
    /// Model loading errors.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// Model architecture not supported.
    #[error("Unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Quantization errors.
    #[error("Quantization error: {0}")]
    Quantization(String),

    /// Training errors.
    #[error("Training error: {0}")]
    Training(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// Adapter operation requested without active LoRA state.
    #[error("No active LoRA adapters: call init_lora first")]
    LoraNotActive,

    /// Adapter weights file does not exist.
    #[error("Adapter path does not exist: {0}")]
    AdapterNotFound(PathBuf),

    /// Checkpoint file extension selects no known serialization format.
    #[error("Unsupported checkpoint format: {0}")]
    UnsupportedCheckpointFormat(String),

    /// MLX backend errors.
    #[error("MLX error: {0}")]
    Mlx(#[from] mlx_rs::error::Exception),

    /// MLX tensor serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] mlx_rs::error::IoError),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
