//! Error taxonomy for the capture and validation pipeline.
//!
//! Every failure belongs to one of four classes (see [`ErrorClass`]):
//! configuration errors are fatal at startup, capture errors fail a single
//! turn, logging errors mean a record was not durably written, and
//! validation errors only ever surface as `UNRESOLVED` turns in the batch
//! report.

use std::path::PathBuf;

use candle_core::DType;
use thiserror::Error;

/// Coarse class of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Weights, schema, dtype or width mismatch. Never recovered.
    Configuration,
    /// Unexpected output from the generation service. Fails one turn.
    Capture,
    /// Disk or serialization failure on the session logs.
    Logging,
    /// Judge unreachable or unparseable.
    Validation,
}

/// All errors produced by the library.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration value or unusable weights store.
    #[error("configuration error: {0}")]
    Config(String),

    /// Activation dtype differs from the decoder's dtype.
    #[error("precision mismatch: decoder runs in {expected:?}, input is {actual:?}")]
    PrecisionMismatch {
        /// Dtype of the loaded decoder weights.
        expected: DType,
        /// Dtype of the offending input.
        actual: DType,
    },

    /// Input width differs from what the decoder or session expects.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Where the mismatch was detected.
        context: String,
        /// Expected width.
        expected: usize,
        /// Observed width.
        actual: usize,
    },

    /// The generation service returned something the session cannot use.
    #[error("capture error: {0}")]
    Capture(String),

    /// The generation request was cancelled before a snapshot was built.
    #[error("capture cancelled for turn {0}")]
    Cancelled(uuid::Uuid),

    /// A complete line in a session log could not be parsed.
    #[error("corrupt log record at {path}:{line}: {reason}")]
    CorruptLog {
        /// Log file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Parser message.
        reason: String,
    },

    /// Transport failure talking to the fabrication judge.
    #[error("judge error: {0}")]
    Judge(String),

    /// Tensor operation failed.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Classify this error according to the pipeline's error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::PrecisionMismatch { .. } => ErrorClass::Configuration,
            Self::DimensionMismatch { .. }
            | Self::Capture(_)
            | Self::Cancelled(_)
            | Self::Tensor(_) => ErrorClass::Capture,
            Self::CorruptLog { .. } | Self::Io(_) | Self::Json(_) => ErrorClass::Logging,
            Self::Judge(_) => ErrorClass::Validation,
        }
    }

    /// Whether this error must abort the process rather than a single turn.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
