// Pedantic clippy configuration for numerical/ML code
#![allow(clippy::cast_precision_loss)] // usize→f64 in rates and means
#![allow(clippy::cast_possible_truncation)] // u64→usize for JSON tool arguments
#![allow(clippy::cast_sign_loss)] // f64→i64 window millis, known positive
#![allow(clippy::module_name_repetitions)] // ValidationEngine in validation.rs is fine
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! confab-rs: Activation Capture & Confabulation Validation
//!
//! Captures a language model's hidden states while it answers, decodes the
//! late-layer state into sparse interpretable features, and later checks
//! what the model *said* about its tool use against what the tool subsystem
//! actually logged.
//!
//! ## Architecture
//!
//! - `weights`: Decoder weight store resolution (local directory or HuggingFace Hub)
//! - `decoder`: Sparse feature decoder (`ReLU(W_enc x + b_enc)`, top-N)
//! - `cache`: Per-layer hidden states returned by one generation call
//! - `regime`: Early-layer regime distance and its PRESERVED/TRANSFORMED label
//! - `capture`: Capture session around the external generation service
//! - `records`: Records written to the session logs
//! - `logger`: Append-only, date-partitioned JSONL session logs
//! - `tools`: Tool execution seam that records every executed call
//! - `judge`: External fabrication judge client and verdict parsing
//! - `validation`: Ground-truth labelling of assistant turns
//! - `analysis`: Per-feature confabulation specificity
//! - `annotations`: Human-readable feature descriptions
//! - `config`: Pipeline configuration
//! - `error`: Error taxonomy

pub mod analysis;
pub mod annotations;
pub mod cache;
pub mod capture;
pub mod config;
pub mod decoder;
pub mod error;
pub mod judge;
pub mod logger;
pub mod records;
pub mod regime;
pub mod tools;
pub mod validation;
pub mod weights;

pub use analysis::{FeatureDiffAnalyzer, FeatureDiffReport, FeatureStat};
pub use annotations::FeatureAnnotations;
pub use cache::LayerActivations;
pub use capture::{
    CancelFlag, CaptureSession, CapturedTurn, ChatMessage, GenerationOutput, GenerationRequest,
    GenerationService, ModelInstance,
};
pub use config::{CaptureConfig, JudgeConfig, PipelineConfig, ValidationConfig};
pub use decoder::{DecoderConfig, FeatureActivation, SparseFeatureDecoder, DEFAULT_TOP_N};
pub use error::{ErrorClass, PipelineError, Result};
pub use judge::{parse_verdict, FabricationJudge, HttpJudge, JudgeVerdict};
pub use logger::{read_stream, LogStream, SessionLogger, SessionSummary};
pub use records::{ActivationSnapshot, ChatTurnRecord, FinishReason, Role, ToolExecutionRecord};
pub use regime::{RegimeLabel, DEFAULT_REGIME_THRESHOLD};
pub use tools::{FeatureIntrospectionTools, RecordingToolRunner, ToolError, ToolExecutor, ToolOutcome};
pub use validation::{
    label_for, LogCorpus, TurnLabel, ValidationEngine, ValidationLabel, ValidationReport,
    ValidationSummary,
};
pub use weights::{DecoderSchema, WeightsStore};
