//! Decoder models that expose their key/value cache.

mod auto_model;
mod base;
mod llama;
mod past_key_values;

pub use auto_model::AutoModel;
pub use base::KvCacheModel;
pub use llama::LlamaModel;
pub use past_key_values::PastKeyValues;
