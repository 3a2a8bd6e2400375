//! Decoder layer weights: loading and device placement.
//!
//! This module provides:
//! - `LayerLoader`: memory-mapped access to safetensors checkpoints
//! - `LayerPlacement`: keep layers resident on the device, or offload them
//!   to host memory and move one layer in per forward call

mod loader;
mod offload;

pub use loader::{classify_tensor_name, LayerLoader, TensorGroup};
pub use offload::{LayerGuard, LayerPlacement};

use candle_core::{Device, Tensor};

use crate::KvCalibError;

/// Layer weight data loaded from disk
pub struct LayerWeights {
    /// Layer index
    pub layer_idx: usize,
    /// Weight tensors keyed by layer-local parameter name
    pub tensors: std::collections::HashMap<String, Tensor>,
}

impl LayerWeights {
    /// Look up a required parameter
    pub fn get(&self, name: &str) -> crate::Result<&Tensor> {
        self.tensors.get(name).ok_or_else(|| {
            KvCalibError::LayerLoadError(format!("Layer {} is missing {}", self.layer_idx, name))
        })
    }

    /// Look up an optional parameter (e.g. a bias)
    pub fn get_opt(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Copy every tensor to `device`
    pub fn to_device(&self, device: &Device) -> crate::Result<LayerWeights> {
        let mut tensors = std::collections::HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            tensors.insert(name.clone(), tensor.to_device(device)?);
        }

        Ok(LayerWeights {
            layer_idx: self.layer_idx,
            tensors,
        })
    }

    /// Bytes held by this layer
    pub fn size_in_bytes(&self) -> usize {
        self.tensors
            .values()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl std::fmt::Debug for LayerWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerWeights")
            .field("layer_idx", &self.layer_idx)
            .field("num_tensors", &self.tensors.len())
            .finish()
    }
}
