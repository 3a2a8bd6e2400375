//! The calibration batch loop.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};

use super::{export_kv_qparams, ExportSummary, KvStatsCollector, ShardSplitter};
use crate::config::CalibConfig;
use crate::data::{CalibBatch, CalibLoader};
use crate::model::{AutoModel, KvCacheModel};
use crate::quantization::QuantScheme;
use crate::utils::{default_dtype, format_bytes, get_device};
use crate::KvCalibError;

/// Run every batch through `model` and feed its cache into `collector`.
///
/// Batches are processed one at a time, in order. The first failure aborts
/// the loop and the statistics gathered so far are left unusable.
pub fn collect_kv_stats<M: KvCacheModel + ?Sized>(
    model: &mut M,
    batches: &[CalibBatch],
    collector: &mut KvStatsCollector,
) -> crate::Result<()> {
    let pb = ProgressBar::new(batches.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Calibrating: [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let result = feed_batches(model, batches, collector, &pb);
    settle_progress(&pb, &result);
    result
}

/// Clear the bar after a full pass, leave it frozen where a batch failed
fn settle_progress(pb: &ProgressBar, result: &crate::Result<()>) {
    match result {
        Ok(()) => pb.finish_and_clear(),
        Err(_) => pb.abandon(),
    }
}

/// The batch loop of [`collect_kv_stats`], advancing `pb` once per batch
fn feed_batches<M: KvCacheModel + ?Sized>(
    model: &mut M,
    batches: &[CalibBatch],
    collector: &mut KvStatsCollector,
    pb: &ProgressBar,
) -> crate::Result<()> {
    for (i, batch) in batches.iter().enumerate() {
        let input_ids = batch.input_ids().to_device(model.device())?;
        let past_key_values = model.forward_kv(&input_ids)?;

        if i == 0 {
            tracing::debug!(
                "KV cache per batch: {} layers, {}",
                past_key_values.len(),
                format_bytes(past_key_values.memory_usage() as u64)
            );
        }

        collector.collect(past_key_values.layers())?;
        pb.inc(1);
    }

    Ok(())
}

/// Collect statistics over `batches` and export the parameters to `output_dir`
pub fn calibrate<M: KvCacheModel + ?Sized>(
    model: &mut M,
    batches: &[CalibBatch],
    scheme: QuantScheme,
    num_tp: usize,
    bits: u8,
    output_dir: impl AsRef<Path>,
) -> crate::Result<ExportSummary> {
    // catch an uneven head split before spending a forward pass
    ShardSplitter::new(num_tp)?.heads_per_shard(model.num_kv_heads())?;

    let mut collector = KvStatsCollector::new(scheme, num_tp)?;
    collect_kv_stats(model, batches, &mut collector)?;

    let session = collector.into_session().ok_or_else(|| {
        KvCalibError::ConsistencyError("no calibration batches were processed".to_string())
    })?;

    tracing::info!(
        "Collected {} batches over {} layers x {} shards",
        session.num_batches(),
        session.num_layers(),
        session.num_tp()
    );

    let summary = export_kv_qparams(&session, bits, output_dir)?;
    match scheme {
        QuantScheme::Symmetric => tracing::info!("KV scales done."),
        QuantScheme::Asymmetric => tracing::info!("KV scales&zeros done."),
    }

    Ok(summary)
}

/// Calibrate a model end to end: load model, tokenizer and corpus, collect
/// statistics and write the artifacts to `config.output_dir`.
pub async fn run(
    config: &CalibConfig,
    hf_token: Option<&str>,
    device_id: Option<usize>,
) -> crate::Result<ExportSummary> {
    config.validate()?;

    let device = get_device(device_id)?;
    let dtype = default_dtype(&device);

    let model_path = AutoModel::resolve_model_path(&config.model, hf_token).await?;
    let tokenizer = CalibLoader::load_tokenizer(model_path.join("tokenizer.json"))?;

    tracing::info!("Loading calibrate dataset ...");
    let loader = CalibLoader::new(
        config.calib_dataset,
        config.resolved_data_path(),
        config.calib_samples,
        config.max_seq_len,
        config.seed,
    );
    let batches = loader.load(&tokenizer, &device)?;

    if config.offload {
        tracing::warn!(
            "Offload mode: decoder layers are kept in host memory and moved to \
             the device one at a time during each forward pass"
        );
    }

    let mut model = AutoModel::load(&model_path, device, dtype, config.offload)?;

    calibrate(
        model.as_mut(),
        &batches,
        config.scheme,
        config.num_tp,
        config.bits,
        &config.output_dir,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PastKeyValues;
    use candle_core::{Device, Tensor};

    /// Returns a fixed cache and counts forward calls
    struct FixedCache {
        layers: usize,
        heads: usize,
        calls: usize,
        device: Device,
    }

    fn fixed_cache(layers: usize, heads: usize) -> FixedCache {
        FixedCache {
            layers,
            heads,
            calls: 0,
            device: Device::Cpu,
        }
    }

    impl KvCacheModel for FixedCache {
        fn num_layers(&self) -> usize {
            self.layers
        }

        fn num_kv_heads(&self) -> usize {
            self.heads
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn forward_kv(&mut self, input_ids: &Tensor) -> crate::Result<PastKeyValues> {
            self.calls += 1;
            let tokens = input_ids.dims()[1];
            let mut pkv = PastKeyValues::default();
            for _ in 0..self.layers {
                let k = Tensor::full(2f32, (1, self.heads, tokens, 4), &Device::Cpu)?;
                let v = Tensor::full(-1f32, (1, self.heads, tokens, 4), &Device::Cpu)?;
                pkv.push(k, v)?;
            }
            Ok(pkv)
        }
    }

    fn batches(n: usize) -> Vec<CalibBatch> {
        (0..n)
            .map(|_| CalibBatch::tokens(vec![1, 2, 3], &Device::Cpu).unwrap())
            .collect()
    }

    #[test]
    fn test_collect_every_batch() {
        let mut model = fixed_cache(2, 4);
        let mut collector = KvStatsCollector::new(QuantScheme::Symmetric, 2).unwrap();

        collect_kv_stats(&mut model, &batches(3), &mut collector).unwrap();

        assert_eq!(model.calls, 3);
        let session = collector.session().unwrap();
        assert_eq!(session.num_batches(), 3);
        assert!(session.k_observers().iter().all(|o| o.len() == 3));
    }

    #[test]
    fn test_progress_stops_at_failing_batch() {
        let mut model = fixed_cache(1, 6);
        let mut collector = KvStatsCollector::new(QuantScheme::Symmetric, 4).unwrap();
        let pb = ProgressBar::hidden();
        pb.set_length(3);

        let result = feed_batches(&mut model, &batches(3), &mut collector, &pb);
        assert!(matches!(result, Err(KvCalibError::ConsistencyError(_))));
        assert_eq!(model.calls, 1);
        assert_eq!(pb.position(), 0);

        settle_progress(&pb, &result);
        assert!(pb.is_finished());
        assert_eq!(pb.position(), 0);
    }

    #[test]
    fn test_calibrate_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = fixed_cache(2, 2);

        let summary =
            calibrate(&mut model, &batches(2), QuantScheme::Symmetric, 1, 8, dir.path()).unwrap();

        assert_eq!(summary.files.len(), 2);
        assert!(summary.degenerate.is_empty());
        assert!(dir.path().join("layers.1.past_kv_scale.0.weight").exists());
    }

    #[test]
    fn test_calibrate_without_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = fixed_cache(1, 2);

        let result = calibrate(&mut model, &[], QuantScheme::Symmetric, 1, 8, dir.path());
        assert!(matches!(result, Err(KvCalibError::ConsistencyError(_))));
    }

    #[test]
    fn test_uneven_split_fails_before_forward() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = fixed_cache(1, 6);

        let result = calibrate(&mut model, &batches(1), QuantScheme::Asymmetric, 4, 8, dir.path());
        assert!(matches!(result, Err(KvCalibError::ConsistencyError(_))));
        assert_eq!(model.calls, 0);
    }
}
