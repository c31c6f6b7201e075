//! Error types for the preference loss engine

use thiserror::Error;

/// Errors surfaced by `PreferenceLossEngine` and configuration validation.
#[derive(Debug, Error)]
pub enum DpoError {
    /// A configuration value makes the objective undefined, or the batch is empty.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A prompt-length marker points past the end of its token sequence.
    #[error(
        "Misaligned input at example {index}: prompt length {prompt_length} exceeds \
        {sequence} sequence length {sequence_length}"
    )]
    MisalignedInput {
        index: usize,
        prompt_length: usize,
        sequence: &'static str,
        sequence_length: usize,
    },

    /// The loss for an example is NaN or infinite.
    #[error("Non-finite loss {value} at example {index}")]
    NumericInstability { index: usize, value: f64 },

    /// Tensor operation error.
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type DpoResult<T> = std::result::Result<T, DpoError>;
