//! Weights store resolution for sparse feature decoders
//!
//! Third-party decoder weights are published under several naming
//! conventions. Instead of hard-coding one, the store tries an ordered list
//! of candidate file names and schema keys; the first match wins, and the
//! error lists every candidate when none is found.
//!
//! A store is either a local directory or a HuggingFace repository
//! (optionally with a sub-folder per hook point, as SAE releases often use).

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use safetensors::tensor::SafeTensors;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::parse_dtype;
use crate::error::{PipelineError, Result};

/// Config file names, in resolution order.
pub const CONFIG_CANDIDATES: &[&str] = &[
    "cfg.json",
    "config.json",
    "sae_config.json",
    "sae_cfg.json",
    "config.yaml",
];

/// Weight file names, in resolution order. Falls back to a lone `*.safetensors`.
pub const WEIGHT_CANDIDATES: &[&str] = &[
    "sae_weights.safetensors",
    "model.safetensors",
    "weights.safetensors",
    "sae.safetensors",
];

const D_IN_KEYS: &[&str] = &["d_in", "d_model", "input_dim", "hidden_size"];
const D_HIDDEN_KEYS: &[&str] = &["d_sae", "d_hidden", "n_features", "dict_size", "num_features"];
const DTYPE_KEYS: &[&str] = &["dtype", "torch_dtype"];
const LAYER_KEYS: &[&str] = &["hook_layer", "layer"];

const ENCODER_WEIGHT_NAMES: &[&str] = &["W_enc", "encoder.weight", "w_enc"];
const ENCODER_BIAS_NAMES: &[&str] = &["b_enc", "encoder.bias"];

/// Where decoder weights live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsStore {
    /// A directory on disk
    Local(PathBuf),
    /// A HuggingFace model repository
    Hub {
        repo: String,
        subfolder: Option<String>,
    },
}

impl WeightsStore {
    /// Interpret a user-provided location: an existing path is local,
    /// anything else is treated as a HuggingFace repository id.
    pub fn resolve(location: &str, subfolder: Option<&str>) -> Self {
        let path = Path::new(location);
        if path.exists() {
            let dir = match subfolder {
                Some(sub) => path.join(sub),
                None => path.to_path_buf(),
            };
            Self::Local(dir)
        } else {
            Self::Hub {
                repo: location.to_string(),
                subfolder: subfolder.map(str::to_string),
            }
        }
    }

    /// Human-readable description for logs and errors.
    pub fn describe(&self) -> String {
        match self {
            Self::Local(dir) => dir.display().to_string(),
            Self::Hub {
                repo,
                subfolder: Some(sub),
            } => format!("{repo}/{sub}"),
            Self::Hub {
                repo,
                subfolder: None,
            } => repo.clone(),
        }
    }

    /// File names available in the store (relative to the sub-folder).
    fn list_files(&self) -> Result<Vec<String>> {
        match self {
            Self::Local(dir) => {
                let entries = std::fs::read_dir(dir).map_err(|e| {
                    PipelineError::Config(format!(
                        "weights store {} is not readable: {e}",
                        dir.display()
                    ))
                })?;
                let mut names = Vec::new();
                for entry in entries {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names.sort();
                Ok(names)
            }
            Self::Hub { repo, subfolder } => {
                let api = Api::new().map_err(|e| {
                    PipelineError::Config(format!("failed to create HuggingFace API: {e}"))
                })?;
                let info = api
                    .repo(Repo::new(repo.clone(), RepoType::Model))
                    .info()
                    .map_err(|e| {
                        PipelineError::Config(format!("failed to list repository {repo}: {e}"))
                    })?;
                let prefix = subfolder.as_ref().map(|s| format!("{s}/"));
                let mut names: Vec<String> = info
                    .siblings
                    .iter()
                    .filter_map(|s| match &prefix {
                        Some(p) => s.rfilename.strip_prefix(p.as_str()).map(str::to_string),
                        None => Some(s.rfilename.clone()),
                    })
                    .filter(|name| !name.contains('/'))
                    .collect();
                names.sort();
                Ok(names)
            }
        }
    }

    /// Local path of a file in the store, downloading it if necessary.
    fn fetch(&self, name: &str) -> Result<PathBuf> {
        match self {
            Self::Local(dir) => Ok(dir.join(name)),
            Self::Hub { repo, subfolder } => {
                let api = Api::new().map_err(|e| {
                    PipelineError::Config(format!("failed to create HuggingFace API: {e}"))
                })?;
                let remote = match subfolder {
                    Some(sub) => format!("{sub}/{name}"),
                    None => name.to_string(),
                };
                info!("Fetching {remote} from {repo}");
                api.repo(Repo::new(repo.clone(), RepoType::Model))
                    .get(&remote)
                    .map_err(|e| {
                        PipelineError::Config(format!("failed to download {remote} from {repo}: {e}"))
                    })
            }
        }
    }

    /// Resolve the config and weight files by convention.
    pub fn locate(&self) -> Result<ResolvedFiles> {
        let available = self.list_files()?;
        let config_name = CONFIG_CANDIDATES
            .iter()
            .find(|c| available.iter().any(|a| a == *c))
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "no decoder config in {} (tried {})",
                    self.describe(),
                    CONFIG_CANDIDATES.join(", ")
                ))
            })?;
        let weights_name = match WEIGHT_CANDIDATES
            .iter()
            .find(|c| available.iter().any(|a| a == *c))
        {
            Some(name) => (*name).to_string(),
            None => {
                let tensors: Vec<&String> = available
                    .iter()
                    .filter(|a| a.ends_with(".safetensors"))
                    .collect();
                match tensors.as_slice() {
                    [only] => (*only).clone(),
                    [] => {
                        return Err(PipelineError::Config(format!(
                            "no decoder weights in {} (tried {} and any *.safetensors)",
                            self.describe(),
                            WEIGHT_CANDIDATES.join(", ")
                        )))
                    }
                    many => {
                        return Err(PipelineError::Config(format!(
                            "ambiguous decoder weights in {}: {} safetensors files and none of {}",
                            self.describe(),
                            many.len(),
                            WEIGHT_CANDIDATES.join(", ")
                        )))
                    }
                }
            }
        };
        debug!("Resolved config={config_name}, weights={weights_name}");
        Ok(ResolvedFiles {
            config_name: (*config_name).to_string(),
            config_path: self.fetch(config_name)?,
            weights_name: weights_name.clone(),
            weights_path: self.fetch(&weights_name)?,
        })
    }
}

/// Files selected by [`WeightsStore::locate`].
#[derive(Debug, Clone)]
pub struct ResolvedFiles {
    pub config_name: String,
    pub config_path: PathBuf,
    pub weights_name: String,
    pub weights_path: PathBuf,
}

/// Decoder schema normalised from whichever config convention was found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecoderSchema {
    pub d_in: Option<usize>,
    pub d_hidden: Option<usize>,
    pub dtype: Option<DType>,
    pub hook_layer: Option<usize>,
}

impl DecoderSchema {
    /// Parse a config file; `.yaml` uses line matching, everything else JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("cannot read decoder config {}: {e}", path.display()))
        })?;
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if is_yaml {
            Self::from_yaml(&text)
        } else {
            let value: Value = serde_json::from_str(&text).map_err(|e| {
                PipelineError::Config(format!(
                    "cannot parse decoder config {}: {e}",
                    path.display()
                ))
            })?;
            Self::from_json(&value)
        }
    }

    /// Normalise a JSON config over the known key aliases.
    pub fn from_json(value: &Value) -> Result<Self> {
        let lookup = |keys: &[&str]| keys.iter().find_map(|k| value.get(*k));
        let as_usize = |v: &Value| {
            v.as_u64()
                .map(|n| n as usize)
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        };
        let dtype = match lookup(DTYPE_KEYS).and_then(Value::as_str) {
            Some(s) => Some(parse_dtype(s)?),
            None => None,
        };
        Ok(Self {
            d_in: lookup(D_IN_KEYS).and_then(as_usize),
            d_hidden: lookup(D_HIDDEN_KEYS).and_then(as_usize),
            dtype,
            hook_layer: lookup(LAYER_KEYS).and_then(as_usize),
        })
    }

    /// Normalise a flat YAML config (`key: value` lines).
    pub fn from_yaml(text: &str) -> Result<Self> {
        let lookup = |keys: &[&str]| keys.iter().find_map(|k| parse_yaml_value(text, k));
        let dtype = match lookup(DTYPE_KEYS) {
            Some(s) => Some(parse_dtype(&s)?),
            None => None,
        };
        Ok(Self {
            d_in: lookup(D_IN_KEYS).and_then(|s| s.parse().ok()),
            d_hidden: lookup(D_HIDDEN_KEYS).and_then(|s| s.parse().ok()),
            dtype,
            hook_layer: lookup(LAYER_KEYS).and_then(|s| s.parse().ok()),
        })
    }
}

/// Encoder tensors as stored, before orientation is normalised.
pub struct RawEncoder {
    pub weight_name: String,
    pub weight: Tensor,
    pub bias: Tensor,
}

/// Read the encoder weight and bias from a safetensors file, trying each
/// known tensor name.
pub fn read_encoder(path: &Path, device: &Device) -> Result<RawEncoder> {
    let data = std::fs::read(path).map_err(|e| {
        PipelineError::Config(format!("cannot read weights {}: {e}", path.display()))
    })?;
    let st = SafeTensors::deserialize(&data).map_err(|e| {
        PipelineError::Config(format!("cannot deserialize weights {}: {e}", path.display()))
    })?;

    let pick = |candidates: &[&str], what: &str| {
        candidates
            .iter()
            .find_map(|name| st.tensor(name).ok().map(|view| (name.to_string(), view)))
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "no {what} tensor in {} (tried {})",
                    path.display(),
                    candidates.join(", ")
                ))
            })
    };

    let (weight_name, w_view) = pick(ENCODER_WEIGHT_NAMES, "encoder weight")?;
    let (_, b_view) = pick(ENCODER_BIAS_NAMES, "encoder bias")?;
    Ok(RawEncoder {
        weight_name,
        weight: tensor_from_view(&w_view, device)?,
        bias: tensor_from_view(&b_view, device)?,
    })
}

/// Value of a flat YAML `key: value` line, quotes stripped.
fn parse_yaml_value(yaml_text: &str, key: &str) -> Option<String> {
    for line in yaml_text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(rest) = rest.strip_prefix(':') {
                let value = rest.trim().trim_matches('"').trim_matches('\'');
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => {
            return Err(PipelineError::Config(format!(
                "unsupported decoder tensor dtype: {other:?}"
            )))
        }
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_aliases_json() {
        let sae_lens = serde_json::json!({"d_in": 5120, "d_sae": 286720, "dtype": "torch.bfloat16", "hook_layer": 30});
        let schema = DecoderSchema::from_json(&sae_lens).unwrap();
        assert_eq!(schema.d_in, Some(5120));
        assert_eq!(schema.d_hidden, Some(286_720));
        assert_eq!(schema.dtype, Some(DType::BF16));
        assert_eq!(schema.hook_layer, Some(30));

        let other = serde_json::json!({"hidden_size": "64", "n_features": 512});
        let schema = DecoderSchema::from_json(&other).unwrap();
        assert_eq!(schema.d_in, Some(64));
        assert_eq!(schema.d_hidden, Some(512));
        assert_eq!(schema.dtype, None);
    }

    #[test]
    fn test_schema_yaml() {
        let yaml = "model_name: \"mistral\"\nd_model: 5120\ndict_size: 286720\ntorch_dtype: 'float16'";
        let schema = DecoderSchema::from_yaml(yaml).unwrap();
        assert_eq!(schema.d_in, Some(5120));
        assert_eq!(schema.d_hidden, Some(286_720));
        assert_eq!(schema.dtype, Some(DType::F16));
    }

    #[test]
    fn test_parse_yaml_value_basic() {
        let yaml = "model_name: \"google/gemma-2-2b\"\nmodel_kind: cross_layer_transcoder";
        assert_eq!(
            parse_yaml_value(yaml, "model_name"),
            Some("google/gemma-2-2b".to_string())
        );
        assert_eq!(
            parse_yaml_value(yaml, "model_kind"),
            Some("cross_layer_transcoder".to_string())
        );
        assert_eq!(parse_yaml_value(yaml, "nonexistent"), None);
    }

    #[test]
    fn test_locate_fails_descriptively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "nothing here").unwrap();
        let store = WeightsStore::Local(dir.path().to_path_buf());
        let err = store.locate().unwrap_err().to_string();
        assert!(err.contains("cfg.json"), "{err}");
        assert!(err.contains("config.yaml"), "{err}");
    }

    #[test]
    fn test_locate_prefers_candidate_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["config.json", "sae_cfg.json", "other.safetensors"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        let store = WeightsStore::Local(dir.path().to_path_buf());
        let files = store.locate().unwrap();
        assert_eq!(files.config_name, "config.json");
        assert_eq!(files.weights_name, "other.safetensors");
    }

    #[test]
    fn test_resolve_local_vs_hub() {
        let dir = tempfile::tempdir().unwrap();
        let local = WeightsStore::resolve(dir.path().to_str().unwrap(), None);
        assert!(matches!(local, WeightsStore::Local(_)));
        let hub = WeightsStore::resolve("org/does-not-exist-locally", Some("blocks.30"));
        assert_eq!(hub.describe(), "org/does-not-exist-locally/blocks.30");
    }
}
