//! External fabrication judge
//!
//! The judge is a remote oracle: it receives `{"content": ...}` and answers
//! with free text that should contain a JSON verdict such as
//! `{"fabricated": true, "fabricated_items": ["..."]}`. Nothing about the
//! response format is guaranteed, so [`parse_verdict`] tries three
//! extraction strategies before giving up.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::JudgeConfig;
use crate::error::{PipelineError, Result};

/// Request body sent to the judge.
#[derive(Debug, Clone, Serialize)]
pub struct JudgeRequest<'a> {
    pub content: &'a str,
}

/// A remote classifier deciding whether content is fabricated.
///
/// `judge` returns the raw response text; an `Err` means the call itself
/// failed (transport, timeout, non-success status).
pub trait FabricationJudge: Send + Sync {
    fn judge(&self, content: &str) -> Result<String>;
}

impl<J: FabricationJudge + ?Sized> FabricationJudge for &J {
    fn judge(&self, content: &str) -> Result<String> {
        (**self).judge(content)
    }
}

/// Parsed judge verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub fabricated: bool,
    #[serde(default, alias = "fabricated_elements")]
    pub fabricated_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

fn fenced_block() -> Option<&'static Regex> {
    static FENCED: OnceLock<Option<Regex>> = OnceLock::new();
    FENCED
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n```").ok())
        .as_ref()
}

/// Extract a verdict from free-form judge output.
///
/// Tried in order: the first fenced code block, the whole text, and the
/// substring from the first `{` to the last `}`. `None` when all three fail
/// or when the JSON lacks a boolean `fabricated` field.
pub fn parse_verdict(text: &str) -> Option<JudgeVerdict> {
    let fenced = fenced_block()
        .and_then(|re| re.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let braces = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    [fenced, Some(text.trim()), braces]
        .into_iter()
        .flatten()
        .find_map(|candidate| serde_json::from_str::<JudgeVerdict>(candidate).ok())
}

/// Judge reached over HTTP with a blocking client.
pub struct HttpJudge {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpJudge {
    /// Build a client from configuration. A configured but unset API key
    /// variable is a configuration error.
    pub fn new(config: &JudgeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build judge client: {e}")))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                PipelineError::Config(format!("judge API key variable {var} is not set"))
            })?),
            None => None,
        };
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl FabricationJudge for HttpJudge {
    fn judge(&self, content: &str) -> Result<String> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&JudgeRequest { content });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|e| PipelineError::Judge(format!("request to {} failed: {e}", self.endpoint)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Judge(format!(
                "{} returned status {status}",
                self.endpoint
            )));
        }
        let body = response
            .text()
            .map_err(|e| PipelineError::Judge(format!("cannot read judge response: {e}")))?;
        debug!("Judge responded with {} bytes", body.len());
        Ok(body)
    }
}
