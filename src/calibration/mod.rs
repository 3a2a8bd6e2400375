//! KV cache statistics collection and quantization parameter export.
//!
//! - `ShardSplitter`: slices a layer's cache into tensor-parallel head shards
//! - `CalibrationSession` / `KvStatsCollector`: the observer pool of a run
//! - `export`: finalization, the `.weight` artifacts and their manifest
//! - `runner`: the batch loop and the end-to-end `run`

mod export;
mod runner;
mod session;
mod splitter;

pub use export::{
    export_kv_qparams, finalize_pair, finalize_session, read_kv_qparams, read_kv_qparams_dir,
    write_kv_qparams, ExportSummary, KvParamsManifest, LayerShard, MANIFEST_FILE,
};
pub use runner::{calibrate, collect_kv_stats, run};
pub use session::{CalibrationSession, KvStatsCollector};
pub use splitter::{ShardSplitter, HEAD_AXIS};
