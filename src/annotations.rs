//! Human-readable feature descriptions
//!
//! Loaded from a JSON object mapping feature index to description,
//! e.g. `{"132378": "Metacognitive monitoring", "60179": "..."}`.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Feature index to description lookup.
#[derive(Debug, Clone, Default)]
pub struct FeatureAnnotations {
    entries: BTreeMap<usize, String>,
}

impl FeatureAnnotations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load annotations from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| {
            PipelineError::Config(format!("annotations {}: {e}", path.display()))
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> = serde_json::from_str(content)?;
        let mut entries = BTreeMap::new();
        for (key, description) in raw {
            let index = key.trim().parse::<usize>().map_err(|_| {
                PipelineError::Config(format!("annotation key '{key}' is not a feature index"))
            })?;
            entries.insert(index, description);
        }
        Ok(Self { entries })
    }

    pub fn insert(&mut self, index: usize, description: impl Into<String>) {
        self.entries.insert(index, description.into());
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Features whose description contains every whitespace-separated term
    /// of `query`, case-insensitive, in index order.
    pub fn search(&self, query: &str) -> Vec<(usize, &str)> {
        let terms: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        self.entries
            .iter()
            .filter(|(_, description)| {
                let lower = description.to_lowercase();
                terms.iter().all(|t| lower.contains(t.as_str()))
            })
            .map(|(&index, description)| (index, description.as_str()))
            .collect()
    }
}
