//! # rs-kvcalib
//!
//! KV cache calibration for transformer language models. Runs a calibration
//! corpus through the model, collects per-layer, per-tensor-parallel-shard
//! statistics of the key/value cache, and exports the int8 quantization
//! parameters a serving engine needs to store the cache as 8-bit integers.
//!
//! ## Pipeline
//!
//! - **Observe**: every batch's `past_key_values` is split along the head
//!   axis into `num_tp` shards and each shard is reduced into its own
//!   [`Observer`] (absmax for symmetric, min/max for asymmetric).
//! - **Finalize**: each observer pair becomes a [`KvQuantParams`] and is
//!   written as `layers.<layer>.past_kv_scale.<shard>.weight`.
//!
//! ## Example
//!
//! ```ignore
//! use rs_kvcalib::{CalibConfig, calibration};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CalibConfig::new("meta-llama/Llama-2-7b-hf");
//!     let summary = calibration::run(&config, None, None).await?;
//!     println!("wrote {} files", summary.files.len());
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod config;
pub mod data;
pub mod layers;
pub mod model;
pub mod quantization;
pub mod utils;

// Re-exports for convenience
pub use calibration::{CalibrationSession, KvStatsCollector, LayerShard, ShardSplitter};
pub use config::{CalibConfig, CalibDataset, Granularity, ModelConfig};
pub use data::{CalibBatch, CalibLoader};
pub use model::{AutoModel, KvCacheModel, LlamaModel, PastKeyValues};
pub use quantization::{KvQuantParams, Observer, QuantParams, QuantScheme, Statistic};
pub use utils::{Device, DType};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum KvCalibError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    #[error("Degenerate range: min {min} == max {max}")]
    DegenerateRange { min: f32, max: f32 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Layer loading failed: {0}")]
    LayerLoadError(String),

    #[error("Dataset error: {0}")]
    DatasetError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, KvCalibError>;
