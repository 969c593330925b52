//! Records persisted in the session logs
//!
//! One JSON object per line per stream. Field names are the on-disk format;
//! changing them breaks reading older logs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::decoder::FeatureActivation;
use crate::regime::RegimeLabel;

/// Anything written to a session log carries the instant that places it in
/// a date partition and a correlation window.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token
    Stop,
    /// Token budget exhausted
    Length,
    /// The model emitted a tool call
    ToolCalls,
}

/// One user/assistant exchange as seen by the generation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurnRecord {
    pub turn_id: Uuid,
    /// Start of generation
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub tools_enabled: bool,
    pub finish_reason: FinishReason,
    /// Last user message that triggered the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl Timestamped for ChatTurnRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Activations captured for one generated turn. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationSnapshot {
    pub turn_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Mean-pooled hidden state per early layer
    pub early_layer_activations: BTreeMap<usize, Vec<f32>>,
    /// Late layer hidden state at the final token
    pub late_layer_activation: Vec<f32>,
    /// Top-N decoded features, strongest first
    pub decoded_features: Vec<FeatureActivation>,
    pub regime_distance: f64,
    pub regime_label: RegimeLabel,
}

impl ActivationSnapshot {
    /// Whether `feature` is among the logged top-N features.
    pub fn contains_feature(&self, feature: usize) -> bool {
        self.decoded_features.iter().any(|f| f.index == feature)
    }
}

impl Timestamped for ActivationSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A tool call the tool subsystem actually executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub arguments: Value,
    /// `null` when the tool ran but failed
    pub result: Option<Value>,
}

impl Timestamped for ToolExecutionRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
