//! Auto model detection and loading.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};

use super::base::KvCacheModel;
use super::llama::LlamaModel;
use crate::config::{ModelArchitecture, ModelConfig};
use crate::utils::{download_model, ensure_model_files, model_cache_dir};
use crate::KvCalibError;

/// Automatic model loader that detects architecture and loads appropriate implementation.
pub struct AutoModel;

impl AutoModel {
    /// Load a model from a local path or HuggingFace Hub
    ///
    /// # Arguments
    /// * `model_id` - Either a local path or HuggingFace model ID (e.g., "meta-llama/Llama-2-7b-hf")
    /// * `device` - Device to run on
    /// * `dtype` - Working precision
    /// * `offload` - Keep decoder layers in host memory between forward calls
    /// * `hf_token` - Optional HuggingFace token for gated models
    pub async fn from_pretrained(
        model_id: &str,
        device: Device,
        dtype: DType,
        offload: bool,
        hf_token: Option<&str>,
    ) -> crate::Result<Box<dyn KvCacheModel>> {
        let model_path = Self::resolve_model_path(model_id, hf_token).await?;
        Self::load(&model_path, device, dtype, offload)
    }

    /// Build the model for an already resolved directory
    pub fn load(
        model_path: impl AsRef<Path>,
        device: Device,
        dtype: DType,
        offload: bool,
    ) -> crate::Result<Box<dyn KvCacheModel>> {
        let model_path = model_path.as_ref();
        let architecture = Self::detect_architecture(model_path)?;

        tracing::info!("Detected architecture: {:?}", architecture);

        let model: Box<dyn KvCacheModel> = match architecture {
            ModelArchitecture::Llama | ModelArchitecture::Mistral | ModelArchitecture::Qwen2 => {
                Box::new(LlamaModel::new(model_path, device, dtype, offload)?)
            }
            ModelArchitecture::InternLM2 => {
                // fused wqkv projection, not Llama naming
                return Err(KvCalibError::UnsupportedArchitecture(
                    "InternLM2 checkpoints are not supported".to_string(),
                ));
            }
            ModelArchitecture::Unknown(arch) => {
                tracing::warn!("Unknown architecture '{}', attempting to load as Llama", arch);
                Box::new(LlamaModel::new(model_path, device, dtype, offload)?)
            }
        };

        Ok(model)
    }

    /// Resolve model path (download if necessary)
    pub async fn resolve_model_path(model_id: &str, hf_token: Option<&str>) -> crate::Result<PathBuf> {
        let path = Path::new(model_id);

        if path.is_dir() {
            ensure_model_files(path).await?;
            return Ok(path.to_path_buf());
        }

        // Not a local directory: treat as a HuggingFace model ID
        if model_id.split('/').count() != 2 {
            return Err(KvCalibError::ModelNotFound(model_id.to_string()));
        }

        let cache_dir = model_cache_dir()?;
        download_model(model_id, &cache_dir, hf_token).await
    }

    /// Get detected architecture for a model
    pub fn detect_architecture(model_path: impl AsRef<Path>) -> crate::Result<ModelArchitecture> {
        let config = ModelConfig::from_file(model_path.as_ref().join("config.json"))?;
        Ok(config.architecture())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internlm2_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"architectures": ["InternLM2ForCausalLM"], "hidden_size": 8,
                "num_attention_heads": 2, "num_hidden_layers": 1, "vocab_size": 10}"#,
        )
        .unwrap();

        let result = AutoModel::load(dir.path(), Device::Cpu, DType::F32, false);
        assert!(matches!(result, Err(KvCalibError::UnsupportedArchitecture(_))));
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_id() {
        let result = AutoModel::resolve_model_path("not-a-dir-or-repo", None).await;
        assert!(matches!(result, Err(KvCalibError::ModelNotFound(_))));
    }
}
