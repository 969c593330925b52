//! Pipeline configuration
//!
//! Every field has a documented default, so an empty JSON object (or no
//! file at all) yields a usable configuration. CLI flags override the file.

use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Top-level configuration for capture, logging and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Local directory or HuggingFace repository holding decoder weights
    pub weights_store: String,
    /// Sub-directory inside the store (e.g. `blocks.30.hook_resid_post`)
    pub weights_subfolder: Option<String>,
    /// Precision of the generation service's hidden states
    pub activation_dtype: String,
    /// Directory holding the date-partitioned session logs
    pub log_dir: PathBuf,
    /// Derived-results file written by the Validation Engine
    pub output: PathBuf,
    pub capture: CaptureConfig,
    pub validation: ValidationConfig,
    pub judge: JudgeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights_store: "Codcordance/Mistral-Small-3.2-24B-Instruct-2506-SAE".to_string(),
            weights_subfolder: None,
            activation_dtype: "bf16".to_string(),
            log_dir: PathBuf::from("session_logs"),
            output: PathBuf::from("validation_results.json"),
            capture: CaptureConfig::default(),
            validation: ValidationConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

/// Which layers the Capture Session pulls and how it classifies the regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// First early layer to capture (inclusive)
    pub early_layer_start: usize,
    /// Last early layer to capture (inclusive)
    pub early_layer_end: usize,
    /// Late layer fed through the sparse feature decoder
    pub late_layer: usize,
    /// The two early layers compared by the regime distance
    pub regime_layers: (usize, usize),
    /// Empirical boundary between PRESERVED and TRANSFORMED. Informational only.
    pub regime_threshold: f64,
    /// Number of decoded features kept per snapshot
    pub top_n: usize,
    /// Hidden width of the generation service
    pub d_model: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            early_layer_start: 1,
            early_layer_end: 5,
            late_layer: 30,
            regime_layers: (3, 4),
            regime_threshold: 50.0,
            top_n: 20,
            d_model: 5120,
        }
    }
}

impl CaptureConfig {
    /// Early layer indices, in ascending order.
    pub fn early_layers(&self) -> Vec<usize> {
        (self.early_layer_start..=self.early_layer_end).collect()
    }

    /// Every layer the generation service must return, ascending and deduplicated.
    pub fn requested_layers(&self) -> Vec<usize> {
        let mut layers = self.early_layers();
        layers.push(self.late_layer);
        layers.sort_unstable();
        layers.dedup();
        layers
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.early_layer_start > self.early_layer_end {
            return Err(PipelineError::Config(format!(
                "early layer range {}..={} is empty",
                self.early_layer_start, self.early_layer_end
            )));
        }
        let early = self.early_layer_start..=self.early_layer_end;
        let (a, b) = self.regime_layers;
        if !early.contains(&a) || !early.contains(&b) {
            return Err(PipelineError::Config(format!(
                "regime layers ({a}, {b}) must lie inside the captured early range {}..={}",
                self.early_layer_start, self.early_layer_end
            )));
        }
        if !self.regime_threshold.is_finite() || self.regime_threshold < 0.0 {
            return Err(PipelineError::Config(format!(
                "regime threshold must be a finite non-negative number, got {}",
                self.regime_threshold
            )));
        }
        if self.top_n == 0 {
            return Err(PipelineError::Config("top_n must be at least 1".into()));
        }
        if self.d_model == 0 {
            return Err(PipelineError::Config("d_model must be positive".into()));
        }
        Ok(())
    }
}

/// Tool records are read from a turn's day and the next, so one day at most.
pub const MAX_TOOL_WINDOW_SECS: f64 = 86_400.0;

/// Batch validation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Tool records within this many seconds after a turn belong to it
    pub tool_window_secs: f64,
    /// Judge calls per turn before giving up (first call included)
    pub max_attempts: u32,
    /// Base delay of the exponential backoff between judge calls
    pub backoff_base_ms: u64,
    /// Phrases that count as the model claiming tool use (informational)
    pub claim_markers: Vec<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            tool_window_secs: 5.0,
            max_attempts: 3,
            backoff_base_ms: 500,
            claim_markers: vec![
                "inspect_feature".to_string(),
                "search_my_features".to_string(),
                "i'll use".to_string(),
                "let me check".to_string(),
            ],
        }
    }
}

impl ValidationConfig {
    /// Tool attribution window as a chrono duration.
    pub fn tool_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.tool_window_secs * 1000.0).round() as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.tool_window_secs.is_finite()
            || self.tool_window_secs <= 0.0
            || self.tool_window_secs > MAX_TOOL_WINDOW_SECS
        {
            return Err(PipelineError::Config(format!(
                "tool window must be in (0, {MAX_TOOL_WINDOW_SECS}]s, got {}s",
                self.tool_window_secs
            )));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config(
                "max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Connection settings for the external fabrication judge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// HTTP endpoint accepting `{"content": ...}`
    pub endpoint: String,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Environment variable holding a bearer token, if the judge needs one
    pub api_key_env: Option<String>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8089/judge".to_string(),
            timeout_secs: 10,
            api_key_env: None,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            PipelineError::Config(format!("cannot parse config {}: {e}", path.display()))
        })?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Resolved activation dtype.
    pub fn dtype(&self) -> Result<DType> {
        parse_dtype(&self.activation_dtype)
    }

    /// Validate every section. Any failure is a fatal configuration error.
    pub fn validate(&self) -> Result<()> {
        self.dtype()?;
        self.capture.validate()?;
        self.validation.validate()?;
        if self.judge.timeout_secs == 0 {
            return Err(PipelineError::Config("judge timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Parse a dtype name as written in configs and third-party weight schemas.
pub fn parse_dtype(name: &str) -> Result<DType> {
    let lower = name.trim().to_lowercase();
    let lower = lower.strip_prefix("torch.").unwrap_or(&lower);
    match lower {
        "f32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(PipelineError::Config(format!("unsupported dtype '{other}'"))),
    }
}
