//! Error types for rust_sctransform

use thiserror::Error;

/// Main error type for VST runs
#[derive(Error, Debug)]
pub enum VstError {
    #[error("Model fit did not converge for gene {gene}")]
    FitNonConvergence { gene: String },

    #[error("Theta estimation did not converge after {iterations} iterations")]
    ThetaNonConvergence { iterations: usize },

    #[error("Insufficient data: {reason}")]
    InsufficientData { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Numeric overflow in {operation}: {details}")]
    NumericOverflow { operation: String, details: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for VST operations
pub type Result<T> = std::result::Result<T, VstError>;
