//! Error taxonomy for the binarization engine.
//!
//! Every variant is fatal to the current training step. Validation runs
//! before any tensor is mutated, so an error never leaves the model
//! half-binarized.

use thiserror::Error;

use crate::binarize::ParamState;

/// Result type alias for binarization operations.
pub type Result<T> = std::result::Result<T, BinarizeError>;

/// Errors raised by [`crate::BinarizeController`] and [`crate::ShadowStore`].
#[derive(Debug, Error)]
pub enum BinarizeError {
    /// No eligible layers, unsupported weight rank, or an invalid policy value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tracked parameter no longer matches its shadow buffer.
    #[error("shape mismatch for target {index} ({name}): shadow {expected:?}, parameter {actual:?}")]
    ShapeMismatch {
        index: usize,
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// An operation was called out of the binarize → restore order.
    #[error("target {index} ({name}) is {actual:?}, operation requires {expected:?}")]
    InvalidState {
        index: usize,
        name: String,
        expected: ParamState,
        actual: ParamState,
    },

    /// Underlying Candle tensor failure.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
