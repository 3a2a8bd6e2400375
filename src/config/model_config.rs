//! Model geometry loaded from a HuggingFace `config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::KvCalibError;

/// Decoder families recognised from `config.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelArchitecture {
    Llama,
    Mistral,
    Qwen2,
    InternLM2,
    Unknown(String),
}

impl ModelArchitecture {
    /// Detect architecture from config.json architectures field
    pub fn from_architectures(architectures: &[String]) -> Self {
        let Some(arch) = architectures.first() else {
            return ModelArchitecture::Unknown("empty".to_string());
        };

        if arch.contains("Qwen2") {
            ModelArchitecture::Qwen2
        } else if arch.contains("InternLM2") {
            ModelArchitecture::InternLM2
        } else if arch.contains("Mistral") {
            ModelArchitecture::Mistral
        } else if arch.contains("Llama") {
            ModelArchitecture::Llama
        } else {
            ModelArchitecture::Unknown(arch.clone())
        }
    }
}

/// The part of a HF `config.json` that shapes the decoder and its cache.
///
/// Unknown keys are ignored, so any Llama-family config parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub architectures: Vec<String>,

    pub hidden_size: usize,

    pub num_attention_heads: usize,

    /// Absent for plain multi-head attention
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    pub num_hidden_layers: usize,

    /// Set by configs whose heads are not `hidden_size / num_attention_heads` wide
    #[serde(default)]
    pub head_dim: Option<usize>,

    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Longest sequence the rotary tables cover
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    2048
}

fn default_rope_theta() -> f64 {
    10000.0
}

impl ModelConfig {
    /// Parse a `config.json`
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            KvCalibError::ModelNotFound(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::from_architectures(&self.architectures)
    }

    /// Heads in each layer's key/value cache
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }

    /// Grouped-query attention: fewer kv heads than query heads
    pub fn is_gqa(&self) -> bool {
        self.num_kv_heads() != self.num_attention_heads
    }

    /// Tensor-parallel degrees that split the KV heads evenly
    pub fn valid_num_tp(&self) -> Vec<usize> {
        let heads = self.num_kv_heads();
        (1..=heads).filter(|tp| heads % tp == 0).collect()
    }

    /// KV cache bytes per token across all layers at `bytes_per_elem`
    pub fn kv_cache_bytes_per_token(&self, bytes_per_elem: usize) -> usize {
        2 * self.num_hidden_layers * self.num_kv_heads() * self.head_dim() * bytes_per_elem
    }
}
