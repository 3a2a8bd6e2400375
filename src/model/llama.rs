//! Llama-family decoder that returns its key/value cache.
//!
//! Covers Llama, Mistral and Qwen2 checkpoints: HF tensor naming, optional
//! q/k/v projection bias, grouped-query attention. Only the decoder stack
//! runs; the final norm and LM head are never loaded.

use std::path::Path;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Embedding, Linear, Module, RmsNorm};

use super::{KvCacheModel, PastKeyValues};
use crate::config::ModelConfig;
use crate::layers::{LayerLoader, LayerPlacement, LayerWeights};
use crate::KvCalibError;

/// Llama decoder with resident or offloaded layers
pub struct LlamaModel {
    /// Model configuration
    config: ModelConfig,
    /// Token embeddings (always on the device)
    embed_tokens: Embedding,
    /// Decoder layer weights
    layers: LayerPlacement,
    /// Device for computation
    device: Device,
    /// Data type
    dtype: DType,
    /// RoPE tables `[max_position_embeddings, head_dim / 2]`
    rope_cos: Tensor,
    rope_sin: Tensor,
}

impl LlamaModel {
    /// Load a model directory holding `config.json` and safetensors shards
    pub fn new(
        model_path: impl AsRef<Path>,
        device: Device,
        dtype: DType,
        offload: bool,
    ) -> crate::Result<Self> {
        let model_path = model_path.as_ref();
        let config = ModelConfig::from_file(model_path.join("config.json"))?;

        if !dtype.is_float() {
            return Err(KvCalibError::ConfigError(format!(
                "model dtype must be floating point, got {:?}",
                dtype
            )));
        }
        if config.head_dim() % 2 != 0 {
            return Err(KvCalibError::UnsupportedArchitecture(format!(
                "rotary embedding needs an even head_dim, got {}",
                config.head_dim()
            )));
        }
        if config.num_attention_heads % config.num_kv_heads() != 0 {
            return Err(KvCalibError::UnsupportedArchitecture(format!(
                "{} attention heads cannot share {} kv heads",
                config.num_attention_heads,
                config.num_kv_heads()
            )));
        }

        let loader = LayerLoader::open(model_path, device.clone(), dtype, config.num_hidden_layers)?;

        tracing::info!("Loading embeddings");
        let embed_tokens = Embedding::new(loader.load_embeddings()?, config.hidden_size);
        let layers = LayerPlacement::load(&loader, offload)?;
        let (rope_cos, rope_sin) = rope_tables(&config, &device, dtype)?;

        Ok(Self {
            config,
            embed_tokens,
            layers,
            device,
            dtype,
            rope_cos,
            rope_sin,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_offloaded(&self) -> bool {
        self.layers.is_offloaded()
    }

    /// Apply rotary position embeddings to `[batch, heads, seq, head_dim]`
    fn apply_rope(&self, x: &Tensor) -> crate::Result<Tensor> {
        let (_, _, seq_len, head_dim) = x.dims4()?;
        let half = head_dim / 2;

        let cos = self.rope_cos.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.rope_sin.narrow(0, 0, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;

        // [x1, x2] -> [x1 * cos - x2 * sin, x2 * cos + x1 * sin]
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;

        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], D::Minus1)?)
    }

    fn rms_norm(&self, x: &Tensor, weight: &Tensor) -> crate::Result<Tensor> {
        let norm = RmsNorm::new(weight.clone(), self.config.rms_norm_eps);
        Ok(norm.forward(x)?)
    }

    /// Self-attention; returns the output with the layer's cached key and value
    fn forward_attention(
        &self,
        hidden_states: &Tensor,
        weights: &LayerWeights,
        mask: &Tensor,
    ) -> crate::Result<(Tensor, Tensor, Tensor)> {
        let (batch_size, seq_len, _) = hidden_states.dims3()?;
        let num_heads = self.config.num_attention_heads;
        let num_kv_heads = self.config.num_kv_heads();
        let head_dim = self.config.head_dim();

        let q = projection(weights, "self_attn.q_proj")?.forward(hidden_states)?;
        let k = projection(weights, "self_attn.k_proj")?.forward(hidden_states)?;
        let v = projection(weights, "self_attn.v_proj")?.forward(hidden_states)?;

        // [batch, heads, seq, head_dim]
        let q = q
            .reshape((batch_size, seq_len, num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch_size, seq_len, num_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch_size, seq_len, num_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.apply_rope(&q)?;
        let k = self.apply_rope(&k)?.contiguous()?;

        let n_rep = num_heads / num_kv_heads;
        let k_full = repeat_kv(&k, n_rep)?;
        let v_full = repeat_kv(&v, n_rep)?;

        let scale = (head_dim as f64).sqrt();
        let scores = (q.matmul(&k_full.t()?)? / scale)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax(&scores.to_dtype(DType::F32)?, D::Minus1)?
            .to_dtype(self.dtype)?;

        let attn_output = probs
            .matmul(&v_full)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, num_heads * head_dim))?;
        let output = projection(weights, "self_attn.o_proj")?.forward(&attn_output)?;

        Ok((output, k, v))
    }

    /// SwiGLU MLP: down(silu(gate(x)) * up(x))
    fn forward_mlp(&self, hidden_states: &Tensor, weights: &LayerWeights) -> crate::Result<Tensor> {
        let gate = projection(weights, "mlp.gate_proj")?.forward(hidden_states)?;
        let up = projection(weights, "mlp.up_proj")?.forward(hidden_states)?;
        let hidden = (candle_nn::ops::silu(&gate)? * up)?;
        Ok(projection(weights, "mlp.down_proj")?.forward(&hidden)?)
    }

    fn forward_layer(
        &self,
        hidden_states: &Tensor,
        weights: &LayerWeights,
        mask: &Tensor,
    ) -> crate::Result<(Tensor, Tensor, Tensor)> {
        let normed = self.rms_norm(hidden_states, weights.get("input_layernorm.weight")?)?;
        let (attn_output, key, value) = self.forward_attention(&normed, weights, mask)?;
        let hidden_states = (hidden_states + attn_output)?;

        let normed = self.rms_norm(&hidden_states, weights.get("post_attention_layernorm.weight")?)?;
        let mlp_output = self.forward_mlp(&normed, weights)?;

        Ok(((hidden_states + mlp_output)?, key, value))
    }
}

impl KvCacheModel for LlamaModel {
    fn num_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn num_kv_heads(&self) -> usize {
        self.config.num_kv_heads()
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_kv(&mut self, input_ids: &Tensor) -> crate::Result<PastKeyValues> {
        let (_, seq_len) = input_ids.dims2()?;
        if seq_len == 0 || seq_len > self.config.max_position_embeddings {
            return Err(KvCalibError::InvalidInput(format!(
                "sequence length {} outside 1..={}",
                seq_len, self.config.max_position_embeddings
            )));
        }

        let mask = causal_mask(seq_len, &self.device, self.dtype)?;
        let mut hidden_states = self.embed_tokens.forward(input_ids)?;
        let mut past_key_values = PastKeyValues::with_capacity(self.num_layers());

        for layer_idx in 0..self.num_layers() {
            let weights = self.layers.acquire(layer_idx)?;
            let (next, key, value) = self.forward_layer(&hidden_states, &weights, &mask)?;
            past_key_values.push(key, value)?;
            hidden_states = next;
        }

        tracing::trace!(
            "Forward pass cached {} layers ({} bytes)",
            past_key_values.len(),
            past_key_values.memory_usage()
        );

        Ok(past_key_values)
    }
}

/// Linear projection `<prefix>.weight` with optional `<prefix>.bias`
fn projection(weights: &LayerWeights, prefix: &str) -> crate::Result<Linear> {
    let weight = weights.get(&format!("{}.weight", prefix))?.clone();
    let bias = weights.get_opt(&format!("{}.bias", prefix)).cloned();
    Ok(Linear::new(weight, bias))
}

/// Expand `[batch, kv_heads, seq, dim]` so each kv head serves `n_rep` query heads
fn repeat_kv(x: &Tensor, n_rep: usize) -> crate::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch_size, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    Ok(Tensor::cat(&vec![x; n_rep], 2)?.reshape((
        batch_size,
        num_kv_heads * n_rep,
        seq_len,
        head_dim,
    ))?)
}

/// Additive mask hiding future positions
fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> crate::Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();

    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?.to_dtype(dtype)?)
}

fn rope_tables(config: &ModelConfig, device: &Device, dtype: DType) -> crate::Result<(Tensor, Tensor)> {
    let head_dim = config.head_dim();
    let max_seq_len = config.max_position_embeddings;
    let theta = config.rope_theta as f32;

    let inv_freq: Vec<f32> = (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / theta.powf(i as f32 / head_dim as f32))
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, head_dim / 2), device)?;

    let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((max_seq_len, 1))?;

    // [max_seq_len, head_dim / 2]
    let freqs = positions.matmul(&inv_freq)?;

    Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
}
