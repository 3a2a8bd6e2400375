//! Forward-pass interface used by calibration.

use candle_core::{Device, Tensor};

use super::PastKeyValues;

/// A decoder model that can run a batch and return its `past_key_values`.
///
/// The returned cache holds one `(key, value)` pair per decoder layer, each
/// shaped `[batch, num_kv_heads, tokens, head_dim]`. Keys are taken after
/// rotary embedding, exactly as the attention cache stores them.
pub trait KvCacheModel: Send {
    /// Get the number of decoder layers
    fn num_layers(&self) -> usize;

    /// Get the number of key/value heads per layer
    fn num_kv_heads(&self) -> usize;

    /// Device the model computes on
    fn device(&self) -> &Device;

    /// Run `input_ids` (`[batch, tokens]`) through every layer
    fn forward_kv(&mut self, input_ids: &Tensor) -> crate::Result<PastKeyValues>;
}
