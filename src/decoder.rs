//! Sparse feature decoder
//!
//! Projects a dense late-layer hidden state into a much wider, mostly-zero
//! feature space and keeps the strongest features:
//!
//! ```text
//! features = ReLU(W_enc @ x + b_enc)        W_enc: [d_hidden, d_in]
//! top_n    = N largest entries of features  (index, activation)
//! ```
//!
//! Weights are loaded once from a [`WeightsStore`] and are read-only
//! afterwards, so one decoder can be shared through an `Arc` by every
//! capture session.
//!
//! The decoder runs at the precision its weights were published in. Inputs
//! of any other dtype are rejected; there is no implicit up- or down-cast.

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::weights::{read_encoder, DecoderSchema, WeightsStore};

/// Default number of features kept per decode.
pub const DEFAULT_TOP_N: usize = 20;

/// One decoded feature: its index in the sparse space and its strength.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureActivation {
    pub index: usize,
    pub activation: f32,
}

impl std::fmt::Display for FeatureActivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}={:.4}", self.index, self.activation)
    }
}

/// Shape and precision of a loaded decoder.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Dense input width (5120 for Mistral Small)
    pub d_in: usize,
    /// Sparse feature count (286,720 for the Mistral Small SAE)
    pub d_hidden: usize,
    /// Precision of weights and accepted inputs
    pub dtype: DType,
    /// Hook layer declared by the store, if any
    pub hook_layer: Option<usize>,
    /// Where the weights came from
    pub source: String,
}

/// Sparse feature decoder with immutable, shareable weights.
pub struct SparseFeatureDecoder {
    w_enc: Tensor, // [d_hidden, d_in]
    b_enc: Tensor, // [d_hidden]
    config: DecoderConfig,
    top_n: usize,
    device: Device,
}

impl SparseFeatureDecoder {
    /// Load decoder weights from a store, resolving file names by convention.
    ///
    /// Any failure here is a configuration error: callers are expected to
    /// abort startup rather than serve requests without a decoder.
    pub fn load(store: &WeightsStore, top_n: usize, device: &Device) -> Result<Self> {
        let files = store.locate()?;
        let schema = DecoderSchema::from_file(&files.config_path)?;
        let raw = read_encoder(&files.weights_path, device)?;
        info!(
            "Decoder files from {}: config={}, weights={} (tensor {})",
            store.describe(),
            files.config_name,
            files.weights_name,
            raw.weight_name
        );

        if let Some(declared) = schema.dtype {
            if declared != raw.weight.dtype() {
                return Err(PipelineError::Config(format!(
                    "{} declares dtype {declared:?} but {} stores {:?}",
                    files.config_name,
                    files.weights_name,
                    raw.weight.dtype()
                )));
            }
        }

        let (rows, cols) = raw.weight.dims2().map_err(|_| {
            PipelineError::Config(format!(
                "encoder weight must be 2D, got shape {:?}",
                raw.weight.dims()
            ))
        })?;

        // sae_lens stores W_enc as [d_in, d_hidden]; nn.Linear as [d_hidden, d_in].
        let d_in = match schema.d_in {
            Some(d) => d,
            None if raw.weight_name == "encoder.weight" => cols,
            None => rows,
        };
        let w_enc = if cols == d_in && (rows != d_in || raw.weight_name == "encoder.weight") {
            raw.weight
        } else if rows == d_in {
            raw.weight.t()?.contiguous()?
        } else {
            return Err(PipelineError::Config(format!(
                "encoder weight shape [{rows}, {cols}] does not contain d_in={d_in}"
            )));
        };

        let mut decoder = Self::from_tensors(w_enc, raw.bias, top_n)?;
        if let Some(declared) = schema.d_hidden {
            if declared != decoder.config.d_hidden {
                return Err(PipelineError::Config(format!(
                    "{} declares {declared} features but the encoder has {}",
                    files.config_name, decoder.config.d_hidden
                )));
            }
        }
        decoder.config.hook_layer = schema.hook_layer;
        decoder.config.source = store.describe();
        info!(
            "Decoder ready: d_in={}, d_hidden={}, dtype={:?}, top_n={}",
            decoder.config.d_in, decoder.config.d_hidden, decoder.config.dtype, top_n
        );
        Ok(decoder)
    }

    /// Build a decoder from in-memory tensors (`w_enc: [d_hidden, d_in]`).
    pub fn from_tensors(w_enc: Tensor, b_enc: Tensor, top_n: usize) -> Result<Self> {
        let (d_hidden, d_in) = w_enc.dims2().map_err(|_| {
            PipelineError::Config(format!(
                "encoder weight must be 2D, got shape {:?}",
                w_enc.dims()
            ))
        })?;
        if b_enc.dims() != [d_hidden] {
            return Err(PipelineError::Config(format!(
                "encoder bias shape {:?} does not match d_hidden={d_hidden}",
                b_enc.dims()
            )));
        }
        if b_enc.dtype() != w_enc.dtype() {
            return Err(PipelineError::Config(format!(
                "encoder bias dtype {:?} differs from weight dtype {:?}",
                b_enc.dtype(),
                w_enc.dtype()
            )));
        }
        if top_n == 0 {
            return Err(PipelineError::Config("top_n must be at least 1".into()));
        }
        let device = w_enc.device().clone();
        let config = DecoderConfig {
            d_in,
            d_hidden,
            dtype: w_enc.dtype(),
            hook_layer: None,
            source: "in-memory".to_string(),
        };
        Ok(Self {
            w_enc,
            b_enc,
            config,
            top_n,
            device,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn d_in(&self) -> usize {
        self.config.d_in
    }

    pub fn d_hidden(&self) -> usize {
        self.config.d_hidden
    }

    pub fn dtype(&self) -> DType {
        self.config.dtype
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Reject inputs whose precision or width differ from the weights.
    fn check_input(&self, x: &Tensor) -> Result<Tensor> {
        if x.dtype() != self.config.dtype {
            return Err(PipelineError::PrecisionMismatch {
                expected: self.config.dtype,
                actual: x.dtype(),
            });
        }
        // Accept a leading batch dimension of 1: [1, d_in]
        let flat = x.flatten_all()?;
        let width = flat.dim(0)?;
        if width != self.config.d_in {
            return Err(PipelineError::DimensionMismatch {
                context: "sparse feature decoder input".to_string(),
                expected: self.config.d_in,
                actual: width,
            });
        }
        Ok(flat.to_device(&self.device)?)
    }

    /// Full feature vector `ReLU(W_enc @ x + b_enc)`, read out as f32.
    fn feature_values(&self, x: &Tensor) -> Result<Vec<f32>> {
        let x = self.check_input(x)?;
        let pre_acts = self.w_enc.matmul(&x.unsqueeze(1)?)?.squeeze(1)?;
        let acts = (&pre_acts + &self.b_enc)?.relu()?;
        // The computation stays in the weights' dtype; only the readout widens.
        Ok(acts.to_dtype(DType::F32)?.to_vec1()?)
    }

    /// Every strictly positive feature, sorted by activation descending
    /// (ties broken by ascending index).
    pub fn encode_all(&self, x: &Tensor) -> Result<Vec<FeatureActivation>> {
        let values = self.feature_values(x)?;
        let mut features: Vec<FeatureActivation> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > 0.0)
            .map(|(index, &activation)| FeatureActivation { index, activation })
            .collect();
        features.sort_by(|a, b| {
            b.activation
                .partial_cmp(&a.activation)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.index.cmp(&b.index))
        });
        Ok(features)
    }

    /// The `top_n` strongest features. An all-zero feature vector yields an
    /// empty list.
    pub fn decode(&self, x: &Tensor) -> Result<Vec<FeatureActivation>> {
        let mut features = self.encode_all(x)?;
        features.truncate(self.top_n);
        Ok(features)
    }
}
