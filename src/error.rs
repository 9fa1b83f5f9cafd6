// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for whisper-decode.

/// Errors that can occur while encoding, decoding, or generating.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Tensor operation or weight loading error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Invalid configuration detected at construction time.
    #[error("config error: {0}")]
    Config(String),

    /// KV cache used against its contract (capacity or ordering).
    #[error("cache misuse: {0}")]
    CacheMisuse(String),

    /// Tensor rank or trailing dimensions disagree with the configuration.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for whisper-decode operations.
pub type Result<T> = std::result::Result<T, DecodeError>;
