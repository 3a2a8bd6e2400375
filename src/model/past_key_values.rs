//! Per-layer key/value cache returned by a forward pass.

use candle_core::Tensor;

use crate::KvCalibError;

/// Ordered `(key, value)` tensors, one pair per decoder layer.
#[derive(Debug, Clone, Default)]
pub struct PastKeyValues {
    layers: Vec<(Tensor, Tensor)>,
}

impl PastKeyValues {
    pub fn with_capacity(num_layers: usize) -> Self {
        Self {
            layers: Vec::with_capacity(num_layers),
        }
    }

    /// Append the cache of the next layer
    ///
    /// # Arguments
    /// * `key` - Key tensor [batch, num_kv_heads, seq_len, head_dim]
    /// * `value` - Value tensor [batch, num_kv_heads, seq_len, head_dim]
    pub fn push(&mut self, key: Tensor, value: Tensor) -> crate::Result<()> {
        if key.dims() != value.dims() {
            return Err(KvCalibError::InvalidInput(format!(
                "layer {} key shape {:?} differs from value shape {:?}",
                self.layers.len(),
                key.dims(),
                value.dims()
            )));
        }
        self.layers.push((key, value));
        Ok(())
    }

    pub fn layers(&self) -> &[(Tensor, Tensor)] {
        &self.layers
    }

    /// Number of layers cached
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Tokens held per layer (dim 2), 0 when empty
    pub fn seq_len(&self) -> usize {
        self.layers
            .first()
            .and_then(|(k, _)| k.dims().get(2).copied())
            .unwrap_or(0)
    }

    /// Get memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|(k, v)| [k, v])
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl From<Vec<(Tensor, Tensor)>> for PastKeyValues {
    fn from(layers: Vec<(Tensor, Tensor)>) -> Self {
        Self { layers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_push_and_usage() {
        let mut pkv = PastKeyValues::with_capacity(2);
        assert!(pkv.is_empty());

        for _ in 0..2 {
            let k = Tensor::zeros((1, 4, 16, 8), DType::F16, &Device::Cpu).unwrap();
            let v = Tensor::zeros((1, 4, 16, 8), DType::F16, &Device::Cpu).unwrap();
            pkv.push(k, v).unwrap();
        }

        assert_eq!(pkv.len(), 2);
        assert_eq!(pkv.seq_len(), 16);
        // 2 layers * 2 tensors * 512 elems * 2 bytes
        assert_eq!(pkv.memory_usage(), 4096);
    }

    #[test]
    fn test_mismatched_pair() {
        let mut pkv = PastKeyValues::default();
        let k = Tensor::zeros((1, 4, 16, 8), DType::F32, &Device::Cpu).unwrap();
        let v = Tensor::zeros((1, 2, 16, 8), DType::F32, &Device::Cpu).unwrap();
        assert!(pkv.push(k, v).is_err());
    }
}
