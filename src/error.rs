// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-probe.

/// Errors that can occur while loading a model or running a probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Weight loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Hook lookup or capture error.
    #[error("hook error: {0}")]
    Hook(String),

    /// Model configuration (`config.json`) parsing error.
    #[error("config error: {0}")]
    Config(String),

    /// Environment variable could not be interpreted.
    #[error("invalid setting {key}={value:?}: {reason}")]
    Settings {
        /// Variable name.
        key: String,
        /// Raw value as read from the environment.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Chat template compilation or rendering error.
    #[error("chat template error: {0}")]
    Template(String),

    /// Model registry resolution or download error.
    #[error("download error: {0}")]
    Download(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-probe operations.
pub type Result<T> = std::result::Result<T, ProbeError>;
