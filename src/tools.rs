//! Tool execution seam
//!
//! The generation service decides when the model calls a tool; this module
//! only runs the call and records that it happened. A `ToolExecutionRecord`
//! exists if and only if a known tool was actually executed, which is what
//! makes the tool stream usable as ground truth during validation.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::annotations::FeatureAnnotations;
use crate::error::Result;
use crate::logger::SessionLogger;
use crate::records::{ActivationSnapshot, ToolExecutionRecord};

/// Failure of a single tool call.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool {tool} failed: {reason}")]
    Failed { tool: String, reason: String },
}

/// Something that can execute named tools with JSON arguments.
pub trait ToolExecutor: Send + Sync {
    /// Names of the tools this executor handles.
    fn tool_names(&self) -> Vec<&'static str>;

    /// Execute `name`. Must return [`ToolError::UnknownTool`] without side
    /// effects for names not in [`ToolExecutor::tool_names`].
    fn execute(&self, name: &str, arguments: &Value) -> std::result::Result<Value, ToolError>;

    fn supports(&self, name: &str) -> bool {
        self.tool_names().contains(&name)
    }
}

/// What happened to one tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Executed; the result was logged.
    Completed(Value),
    /// Executed but failed; logged with a `null` result.
    Failed(String),
    /// Not executed, nothing logged.
    Unknown,
}

/// Runs tool calls and appends a `ToolExecutionRecord` for each execution.
pub struct RecordingToolRunner<E> {
    executor: E,
    logger: Arc<SessionLogger>,
}

impl<E: ToolExecutor> RecordingToolRunner<E> {
    pub fn new(executor: E, logger: Arc<SessionLogger>) -> Self {
        Self { executor, logger }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Execute a call and record it. The outer error is a logging failure.
    pub fn run(&self, name: &str, arguments: Value) -> Result<ToolOutcome> {
        if !self.executor.supports(name) {
            warn!("Model requested unknown tool '{name}', not executed");
            return Ok(ToolOutcome::Unknown);
        }
        let started = Utc::now();
        let (result, outcome) = match self.executor.execute(name, &arguments) {
            Ok(value) => (Some(value.clone()), ToolOutcome::Completed(value)),
            Err(ToolError::UnknownTool(_)) => return Ok(ToolOutcome::Unknown),
            Err(e) => {
                warn!("{e}");
                (None, ToolOutcome::Failed(e.to_string()))
            }
        };
        self.logger.log_tool_execution(&ToolExecutionRecord {
            timestamp: started,
            tool_name: name.to_string(),
            arguments,
            result,
        })?;
        debug!("Recorded execution of {name}");
        Ok(outcome)
    }
}

const SEARCH_FEATURES: &str = "search_my_features";
const INSPECT_FEATURE: &str = "inspect_feature";
const CHECK_ACTIVATIONS: &str = "check_my_activations";
const COMPARE_FEATURES: &str = "compare_features";

/// Introspection tools over feature annotations and the most recent
/// activation snapshot.
pub struct FeatureIntrospectionTools {
    annotations: FeatureAnnotations,
    last_snapshot: RwLock<Option<ActivationSnapshot>>,
}

impl FeatureIntrospectionTools {
    pub fn new(annotations: FeatureAnnotations) -> Self {
        Self {
            annotations,
            last_snapshot: RwLock::new(None),
        }
    }

    /// Make `snapshot` visible to `check_my_activations`.
    pub fn store_snapshot(&self, snapshot: ActivationSnapshot) {
        *self.last_snapshot.write() = Some(snapshot);
    }

    fn describe(&self, index: usize) -> Value {
        match self.annotations.get(index) {
            Some(description) => json!({ "idx": index, "description": description }),
            None => json!({ "idx": index, "description": null }),
        }
    }

    fn search(&self, arguments: &Value) -> std::result::Result<Value, ToolError> {
        let query = str_arg(SEARCH_FEATURES, arguments, "query")?;
        let top_k = arguments
            .get("top_k")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;
        let hits = self.annotations.search(query);
        let results: Vec<Value> = hits
            .iter()
            .take(top_k)
            .map(|&(idx, description)| json!({ "idx": idx, "description": description }))
            .collect();
        Ok(json!({ "query": query, "results": results, "total_found": hits.len() }))
    }

    fn check_activations(&self) -> std::result::Result<Value, ToolError> {
        let guard = self.last_snapshot.read();
        let snapshot = guard.as_ref().ok_or_else(|| ToolError::Failed {
            tool: CHECK_ACTIVATIONS.into(),
            reason: "no activations captured yet".into(),
        })?;
        Ok(json!({
            "turn_id": snapshot.turn_id,
            "timestamp": snapshot.timestamp,
            "top_features": snapshot.decoded_features,
            "regime": snapshot.regime_label,
            "regime_distance": snapshot.regime_distance,
        }))
    }
}

impl ToolExecutor for FeatureIntrospectionTools {
    fn tool_names(&self) -> Vec<&'static str> {
        vec![SEARCH_FEATURES, INSPECT_FEATURE, CHECK_ACTIVATIONS, COMPARE_FEATURES]
    }

    fn execute(&self, name: &str, arguments: &Value) -> std::result::Result<Value, ToolError> {
        match name {
            SEARCH_FEATURES => self.search(arguments),
            INSPECT_FEATURE => Ok(self.describe(index_arg(name, arguments, "feature_idx")?)),
            CHECK_ACTIVATIONS => self.check_activations(),
            COMPARE_FEATURES => {
                let a = index_arg(name, arguments, "feature_idx_a")?;
                let b = index_arg(name, arguments, "feature_idx_b")?;
                Ok(json!({ "feature_a": self.describe(a), "feature_b": self.describe(b) }))
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn str_arg<'a>(tool: &str, arguments: &'a Value, key: &str) -> std::result::Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::Failed {
            tool: tool.to_string(),
            reason: format!("missing string argument '{key}'"),
        })
}

fn index_arg(tool: &str, arguments: &Value, key: &str) -> std::result::Result<usize, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .ok_or_else(|| ToolError::Failed {
            tool: tool.to_string(),
            reason: format!("missing feature index argument '{key}'"),
        })
}
