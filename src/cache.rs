//! Per-layer hidden states returned by one generation call

use std::collections::BTreeMap;

use candle_core::{DType, IndexOp, Tensor};

use crate::error::{PipelineError, Result};

/// Hidden states keyed by layer index.
///
/// Each tensor holds every token position: shape `(seq_len, d_model)`.
/// A leading batch dimension of 1 is squeezed away on insert.
#[derive(Debug, Default, Clone)]
pub struct LayerActivations {
    layers: BTreeMap<usize, Tensor>,
}

impl LayerActivations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer's hidden states, `(seq_len, d_model)` or `(1, seq_len, d_model)`.
    pub fn insert(&mut self, layer: usize, tensor: Tensor) -> Result<()> {
        let tensor = match tensor.rank() {
            2 => tensor,
            3 if tensor.dim(0)? == 1 => tensor.squeeze(0)?,
            _ => {
                return Err(PipelineError::Capture(format!(
                    "layer {layer}: expected (seq_len, d_model) hidden states, got {:?}",
                    tensor.dims()
                )))
            }
        };
        self.layers.insert(layer, tensor);
        Ok(())
    }

    /// Hidden states for a layer, shape `(seq_len, d_model)`.
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.layers.get(&layer)
    }

    fn require(&self, layer: usize) -> Result<&Tensor> {
        self.layers.get(&layer).ok_or_else(|| {
            PipelineError::Capture(format!("generation service returned no layer {layer}"))
        })
    }

    /// Layer indices present, ascending.
    pub fn layer_indices(&self) -> Vec<usize> {
        self.layers.keys().copied().collect()
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Check that every requested layer is present with the expected width,
    /// dtype, and a non-empty, shared sequence length.
    pub fn validate(&self, layers: &[usize], d_model: usize, dtype: DType) -> Result<usize> {
        let mut seq_len: Option<usize> = None;
        for &layer in layers {
            let tensor = self.require(layer)?;
            let (len, width) = tensor.dims2()?;
            if width != d_model {
                return Err(PipelineError::DimensionMismatch {
                    context: format!("hidden states of layer {layer}"),
                    expected: d_model,
                    actual: width,
                });
            }
            if tensor.dtype() != dtype {
                return Err(PipelineError::Capture(format!(
                    "layer {layer} hidden states are {:?}, expected {dtype:?}",
                    tensor.dtype()
                )));
            }
            if len == 0 {
                return Err(PipelineError::Capture(format!(
                    "layer {layer} hidden states cover zero tokens"
                )));
            }
            match seq_len {
                Some(expected) if expected != len => {
                    return Err(PipelineError::Capture(format!(
                        "layer {layer} covers {len} tokens, other layers cover {expected}"
                    )))
                }
                _ => seq_len = Some(len),
            }
        }
        seq_len.ok_or_else(|| PipelineError::Capture("no layers requested".into()))
    }

    /// Mean over the token sequence, shape `(d_model,)`, in the layer's dtype.
    pub fn mean_pool(&self, layer: usize) -> Result<Tensor> {
        Ok(self.require(layer)?.mean(0)?)
    }

    /// Hidden state of the final token, shape `(d_model,)`.
    pub fn last_position(&self, layer: usize) -> Result<Tensor> {
        let tensor = self.require(layer)?;
        let seq_len = tensor.dim(0)?;
        if seq_len == 0 {
            return Err(PipelineError::Capture(format!(
                "layer {layer} hidden states cover zero tokens"
            )));
        }
        Ok(tensor.i(seq_len - 1)?)
    }
}

/// Read a 1-D tensor out as f32 values for persistence.
pub fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn filled(seq_len: usize, d_model: usize, value: f32) -> Tensor {
        Tensor::full(value, (seq_len, d_model), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_insert_squeezes_batch() {
        let mut cache = LayerActivations::new();
        assert!(cache.is_empty());
        let t = Tensor::zeros((1, 7, 16), DType::F32, &Device::Cpu).unwrap();
        cache.insert(3, t).unwrap();
        assert_eq!(cache.get_layer(3).unwrap().dims(), &[7, 16]);
        assert_eq!(cache.layer_indices(), vec![3]);
        assert!(cache.get_layer(4).is_none());
    }

    #[test]
    fn test_insert_rejects_wrong_rank() {
        let mut cache = LayerActivations::new();
        let t = Tensor::zeros((16,), DType::F32, &Device::Cpu).unwrap();
        assert!(cache.insert(0, t).is_err());
    }

    #[test]
    fn test_validate_width_and_missing_layers() {
        let mut cache = LayerActivations::new();
        cache.insert(1, filled(4, 8, 1.0)).unwrap();
        cache.insert(2, filled(4, 6, 1.0)).unwrap();
        assert_eq!(cache.validate(&[1], 8, DType::F32).unwrap(), 4);
        assert!(matches!(
            cache.validate(&[1, 2], 8, DType::F32),
            Err(PipelineError::DimensionMismatch { actual: 6, .. })
        ));
        assert!(cache.validate(&[1, 9], 8, DType::F32).is_err());
        assert!(cache.validate(&[1], 8, DType::BF16).is_err());
    }

    #[test]
    fn test_mean_pool_and_last_position() {
        let data: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let t = Tensor::from_vec(data, (3, 2), &Device::Cpu).unwrap();
        let mut cache = LayerActivations::new();
        cache.insert(0, t).unwrap();

        let pooled = to_f32_vec(&cache.mean_pool(0).unwrap()).unwrap();
        assert_eq!(pooled, vec![3.0, 4.0]);
        let last = to_f32_vec(&cache.last_position(0).unwrap()).unwrap();
        assert_eq!(last, vec![5.0, 6.0]);
    }
}
