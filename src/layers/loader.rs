//! Memory-mapped access to a model's safetensors shards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use safetensors::SafeTensors;

use super::LayerWeights;
use crate::KvCalibError;

/// Which part of the model a checkpoint tensor belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorGroup {
    Embedding,
    /// Decoder layer index and the name local to that layer
    Layer(usize, String),
    Norm,
    LmHead,
    Other,
}

/// Classify a checkpoint tensor name.
///
/// `model.layers.3.self_attn.k_proj.weight` -> `Layer(3, "self_attn.k_proj.weight")`
pub fn classify_tensor_name(name: &str) -> TensorGroup {
    if name.contains("embed_tokens") || name.contains("tok_embeddings") {
        return TensorGroup::Embedding;
    }
    if name.starts_with("lm_head") || name == "output.weight" {
        return TensorGroup::LmHead;
    }

    let parts: Vec<&str> = name.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == "layers" {
            if let Some(Ok(idx)) = parts.get(i + 1).map(|s| s.parse::<usize>()) {
                return TensorGroup::Layer(idx, parts[i + 2..].join("."));
            }
        }
    }

    if name.ends_with("norm.weight") {
        TensorGroup::Norm
    } else {
        TensorGroup::Other
    }
}

/// Loads embeddings and decoder layers from memory-mapped safetensors files.
pub struct LayerLoader {
    /// Model directory
    model_dir: PathBuf,
    /// Mapped shard files
    shards: Vec<Mmap>,
    /// Full tensor name -> shard index
    index: HashMap<String, usize>,
    /// Per layer: (full name, layer-local name)
    layer_tensors: Vec<Vec<(String, String)>>,
    /// Embedding tensor name, if found
    embed_name: Option<String>,
    /// Device to load tensors to
    device: Device,
    /// Data type for tensors
    dtype: DType,
}

impl LayerLoader {
    /// Map every `*.safetensors` file under `model_dir` and index its tensors
    pub fn open(
        model_dir: impl AsRef<Path>,
        device: Device,
        dtype: DType,
        num_layers: usize,
    ) -> crate::Result<Self> {
        let model_dir = model_dir.as_ref().to_path_buf();
        let files = find_safetensor_files(&model_dir)?;
        if files.is_empty() {
            return Err(KvCalibError::ModelNotFound(format!(
                "no safetensors files in {:?}",
                model_dir
            )));
        }

        let mut shards = Vec::with_capacity(files.len());
        let mut index = HashMap::new();
        let mut layer_tensors = vec![Vec::new(); num_layers];
        let mut embed_name = None;

        for (shard_idx, path) in files.iter().enumerate() {
            tracing::debug!("Mapping {:?}", path);
            let file = std::fs::File::open(path)?;
            let mmap = unsafe { Mmap::map(&file)? };

            let names: Vec<String> = SafeTensors::deserialize(&mmap)
                .map_err(|e| KvCalibError::LayerLoadError(e.to_string()))?
                .names()
                .into_iter()
                .cloned()
                .collect();

            for name in names {
                match classify_tensor_name(&name) {
                    TensorGroup::Layer(idx, local) if idx < num_layers => {
                        layer_tensors[idx].push((name.clone(), local));
                    }
                    TensorGroup::Embedding => embed_name = Some(name.clone()),
                    _ => {}
                }
                index.insert(name, shard_idx);
            }

            shards.push(mmap);
        }

        if let Some(missing) = layer_tensors.iter().position(Vec::is_empty) {
            return Err(KvCalibError::LayerLoadError(format!(
                "no tensors found for layer {}",
                missing
            )));
        }

        Ok(Self {
            model_dir,
            shards,
            index,
            layer_tensors,
            embed_name,
            device,
            dtype,
        })
    }

    /// Load a tensor by full checkpoint name to host memory
    fn load_tensor_cpu(&self, name: &str) -> crate::Result<Tensor> {
        let shard = *self.index.get(name).ok_or_else(|| {
            KvCalibError::LayerLoadError(format!("tensor {} not found in {:?}", name, self.model_dir))
        })?;

        let safetensors = SafeTensors::deserialize(&self.shards[shard])
            .map_err(|e| KvCalibError::LayerLoadError(e.to_string()))?;
        let view = safetensors
            .tensor(name)
            .map_err(|e| KvCalibError::LayerLoadError(e.to_string()))?;

        let dtype = convert_safetensor_dtype(view.dtype())?;
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?;
        Ok(tensor.to_dtype(self.dtype)?)
    }

    /// Load the token embedding matrix to the device
    pub fn load_embeddings(&self) -> crate::Result<Tensor> {
        let name = self.embed_name.as_deref().ok_or_else(|| {
            KvCalibError::LayerLoadError("embedding weights not found".to_string())
        })?;
        Ok(self.load_tensor_cpu(name)?.to_device(&self.device)?)
    }

    /// Load a decoder layer to host memory
    pub fn load_layer_to_cpu(&self, layer_idx: usize) -> crate::Result<LayerWeights> {
        let names = self.layer_tensors.get(layer_idx).ok_or_else(|| {
            KvCalibError::LayerLoadError(format!(
                "Layer index {} out of range ({} layers)",
                layer_idx,
                self.layer_tensors.len()
            ))
        })?;

        let mut tensors = HashMap::with_capacity(names.len());
        for (full, local) in names {
            tensors.insert(local.clone(), self.load_tensor_cpu(full)?);
        }

        Ok(LayerWeights { layer_idx, tensors })
    }

    /// Load a decoder layer straight to the device
    pub fn load_layer(&self, layer_idx: usize) -> crate::Result<LayerWeights> {
        self.load_layer_to_cpu(layer_idx)?.to_device(&self.device)
    }

    /// Get number of layers
    pub fn num_layers(&self) -> usize {
        self.layer_tensors.len()
    }

    /// Get the device
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Get the dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

fn find_safetensor_files(dir: &Path) -> crate::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }

    // Sort for consistent ordering
    files.sort();
    Ok(files)
}

/// Convert safetensor dtype to candle dtype
fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> crate::Result<DType> {
    match dtype {
        safetensors::Dtype::F16 => Ok(DType::F16),
        safetensors::Dtype::BF16 => Ok(DType::BF16),
        safetensors::Dtype::F32 => Ok(DType::F32),
        safetensors::Dtype::F64 => Ok(DType::F64),
        other => Err(KvCalibError::LayerLoadError(format!(
            "unsupported weight dtype {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tensor_name() {
        assert_eq!(
            classify_tensor_name("model.embed_tokens.weight"),
            TensorGroup::Embedding
        );
        assert_eq!(
            classify_tensor_name("model.layers.5.self_attn.q_proj.weight"),
            TensorGroup::Layer(5, "self_attn.q_proj.weight".to_string())
        );
        assert_eq!(classify_tensor_name("lm_head.weight"), TensorGroup::LmHead);
        assert_eq!(classify_tensor_name("model.norm.weight"), TensorGroup::Norm);
        assert_eq!(
            classify_tensor_name("model.rotary_emb.inv_freq"),
            TensorGroup::Other
        );
    }

    #[test]
    fn test_dtype_conversion() {
        assert!(matches!(
            convert_safetensor_dtype(safetensors::Dtype::BF16),
            Ok(DType::BF16)
        ));
        assert!(convert_safetensor_dtype(safetensors::Dtype::I8).is_err());
    }

    #[test]
    fn test_open_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = LayerLoader::open(dir.path(), Device::Cpu, DType::F32, 1);
        assert!(matches!(result, Err(KvCalibError::ModelNotFound(_))));
    }
}
