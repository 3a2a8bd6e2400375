//! Per-(layer, shard) observer pool for one calibration run.

use candle_core::Tensor;

use super::{LayerShard, ShardSplitter};
use crate::quantization::{Observer, QuantScheme};
use crate::KvCalibError;

/// Key and value observers for every (layer, shard), indexed
/// `layer * num_tp + shard`.
#[derive(Debug, Clone)]
pub struct CalibrationSession {
    scheme: QuantScheme,
    splitter: ShardSplitter,
    num_layers: usize,
    k_observers: Vec<Observer>,
    v_observers: Vec<Observer>,
    num_batches: usize,
}

impl CalibrationSession {
    /// Create and enable `num_layers * num_tp` observer pairs
    pub fn new(scheme: QuantScheme, num_layers: usize, num_tp: usize) -> crate::Result<Self> {
        let splitter = ShardSplitter::new(num_tp)?;
        if num_layers == 0 {
            return Err(KvCalibError::ConsistencyError(
                "cannot calibrate a model without layers".to_string(),
            ));
        }

        let count = num_layers * num_tp;
        let mut k_observers = Vec::with_capacity(count);
        let mut v_observers = Vec::with_capacity(count);
        for _ in 0..count {
            let mut k_observer = Observer::new(scheme);
            let mut v_observer = Observer::new(scheme);
            k_observer.enable();
            v_observer.enable();
            k_observers.push(k_observer);
            v_observers.push(v_observer);
        }

        tracing::debug!(
            "Created {} observer pairs ({} layers x {} shards, {})",
            count,
            num_layers,
            num_tp,
            scheme
        );

        Ok(Self {
            scheme,
            splitter,
            num_layers,
            k_observers,
            v_observers,
            num_batches: 0,
        })
    }

    /// Split each layer's cache into shards and feed every shard to its
    /// observers. `past_key_values` holds one `(key, value)` pair per layer.
    pub fn observe(&mut self, past_key_values: &[(Tensor, Tensor)]) -> crate::Result<()> {
        let num_tp = self.splitter.num_tp();
        let expected = past_key_values.len() * num_tp;

        if self.k_observers.len() != expected || self.v_observers.len() != expected {
            return Err(KvCalibError::ConsistencyError(format!(
                "session holds {} key / {} value observers but the batch has {} layers x {} shards",
                self.k_observers.len(),
                self.v_observers.len(),
                past_key_values.len(),
                num_tp
            )));
        }

        // all layers are reduced before any observer is updated
        let mut stats = Vec::with_capacity(expected);
        for (k_cache, v_cache) in past_key_values {
            let k_shards = self.splitter.split(k_cache)?;
            let v_shards = self.splitter.split(v_cache)?;

            for (k_shard, v_shard) in k_shards.iter().zip(v_shards.iter()) {
                stats.push((self.scheme.reduce(k_shard)?, self.scheme.reduce(v_shard)?));
            }
        }

        for (idx, (k_stat, v_stat)) in stats.into_iter().enumerate() {
            self.k_observers[idx].record(k_stat);
            self.v_observers[idx].record(v_stat);
        }

        self.num_batches += 1;
        Ok(())
    }

    pub fn scheme(&self) -> QuantScheme {
        self.scheme
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn num_tp(&self) -> usize {
        self.splitter.num_tp()
    }

    /// Batches accepted so far
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn k_observers(&self) -> &[Observer] {
        &self.k_observers
    }

    pub fn v_observers(&self) -> &[Observer] {
        &self.v_observers
    }

    /// Observer pairs with their (layer, shard) coordinates, in index order
    pub fn observer_pairs(&self) -> impl Iterator<Item = (LayerShard, &Observer, &Observer)> {
        let num_tp = self.splitter.num_tp();
        self.k_observers
            .iter()
            .zip(self.v_observers.iter())
            .enumerate()
            .map(move |(i, (k, v))| (LayerShard::from_index(i, num_tp), k, v))
    }
}

/// Owns the lazily created [`CalibrationSession`] of a run.
///
/// The pool is sized from the first batch; every later batch is checked
/// against it.
#[derive(Debug)]
pub struct KvStatsCollector {
    scheme: QuantScheme,
    num_tp: usize,
    session: Option<CalibrationSession>,
}

impl KvStatsCollector {
    pub fn new(scheme: QuantScheme, num_tp: usize) -> crate::Result<Self> {
        ShardSplitter::new(num_tp)?;
        Ok(Self {
            scheme,
            num_tp,
            session: None,
        })
    }

    /// Collect statistics for one batch's `past_key_values`
    pub fn collect(&mut self, past_key_values: &[(Tensor, Tensor)]) -> crate::Result<()> {
        let session = match self.session.take() {
            Some(session) => session,
            None => CalibrationSession::new(self.scheme, past_key_values.len(), self.num_tp)?,
        };

        self.session.insert(session).observe(past_key_values)
    }

    pub fn scheme(&self) -> QuantScheme {
        self.scheme
    }

    pub fn num_tp(&self) -> usize {
        self.num_tp
    }

    pub fn session(&self) -> Option<&CalibrationSession> {
        self.session.as_ref()
    }

    /// Hand over the session; `None` when no batch was ever collected
    pub fn into_session(self) -> Option<CalibrationSession> {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::Statistic;
    use candle_core::Device;

    fn layer(heads: usize, fill: f32) -> (Tensor, Tensor) {
        let n = 2 * heads * 3 * 4;
        let k: Vec<f32> = (0..n).map(|i| fill * (i % 7) as f32).collect();
        let v: Vec<f32> = (0..n).map(|i| -fill * (i % 5) as f32).collect();
        (
            Tensor::from_vec(k, &[2, heads, 3, 4], &Device::Cpu).unwrap(),
            Tensor::from_vec(v, &[2, heads, 3, 4], &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn test_pool_size_and_buffer_lengths() {
        let (num_layers, num_tp, num_batches) = (3, 2, 4);
        let mut collector = KvStatsCollector::new(QuantScheme::Symmetric, num_tp).unwrap();

        for b in 0..num_batches {
            let past: Vec<_> = (0..num_layers).map(|_| layer(4, b as f32 + 1.0)).collect();
            collector.collect(&past).unwrap();
        }

        let session = collector.session().unwrap();
        assert_eq!(session.k_observers().len(), num_layers * num_tp);
        assert_eq!(session.v_observers().len(), num_layers * num_tp);
        assert_eq!(session.num_batches(), num_batches);
        for (k, v) in session.k_observers().iter().zip(session.v_observers()) {
            assert!(k.is_enabled() && v.is_enabled());
            assert_eq!(k.len(), num_batches);
            assert_eq!(v.len(), num_batches);
        }
    }

    #[test]
    fn test_layer_count_mismatch_after_init() {
        let mut collector = KvStatsCollector::new(QuantScheme::Asymmetric, 2).unwrap();
        collector.collect(&[layer(4, 1.0), layer(4, 1.0)]).unwrap();

        let result = collector.collect(&[layer(4, 1.0)]);
        assert!(matches!(result, Err(KvCalibError::ConsistencyError(_))));

        let session = collector.session().unwrap();
        assert!(session.k_observers().iter().all(|o| o.len() == 1));
    }

    #[test]
    fn test_uneven_heads_rejected() {
        let mut collector = KvStatsCollector::new(QuantScheme::Symmetric, 4).unwrap();
        let result = collector.collect(&[layer(6, 1.0)]);
        assert!(matches!(result, Err(KvCalibError::ConsistencyError(_))));
    }

    #[test]
    fn test_failing_later_layer_leaves_buffers_untouched() {
        let mut collector = KvStatsCollector::new(QuantScheme::Symmetric, 2).unwrap();
        collector.collect(&[layer(4, 1.0), layer(4, 1.0)]).unwrap();

        // layer 0 splits fine, layer 1 does not
        let result = collector.collect(&[layer(4, 2.0), layer(5, 2.0)]);
        assert!(matches!(result, Err(KvCalibError::ConsistencyError(_))));

        let session = collector.session().unwrap();
        assert_eq!(session.num_batches(), 1);
        assert!(session.k_observers().iter().all(|o| o.len() == 1));
        assert!(session.v_observers().iter().all(|o| o.len() == 1));
    }

    #[test]
    fn test_non_finite_later_layer_leaves_buffers_untouched() {
        let mut session = CalibrationSession::new(QuantScheme::Asymmetric, 2, 1).unwrap();
        let bad = Tensor::full(f32::INFINITY, (1, 2, 3, 4), &Device::Cpu).unwrap();

        let result = session.observe(&[layer(2, 1.0), (bad.clone(), bad)]);
        assert!(matches!(result, Err(KvCalibError::InvalidInput(_))));
        assert_eq!(session.num_batches(), 0);
        assert!(session.k_observers().iter().all(|o| o.is_empty()));
        assert!(session.v_observers().iter().all(|o| o.is_empty()));
    }

    #[test]
    fn test_shards_see_their_own_heads() {
        // head h of the key cache holds the constant h
        let data: Vec<f32> = (0..4).flat_map(|h| vec![h as f32; 2]).collect();
        let k = Tensor::from_vec(data.clone(), &[1, 4, 1, 2], &Device::Cpu).unwrap();
        let v = Tensor::from_vec(data, &[1, 4, 1, 2], &Device::Cpu).unwrap();

        let mut session = CalibrationSession::new(QuantScheme::Asymmetric, 1, 2).unwrap();
        session.observe(&[(k, v)]).unwrap();

        assert_eq!(
            session.k_observers()[0].buffer(),
            &[Statistic::MinMax { min: 0.0, max: 1.0 }]
        );
        assert_eq!(
            session.k_observers()[1].buffer(),
            &[Statistic::MinMax { min: 2.0, max: 3.0 }]
        );
    }

    #[test]
    fn test_observer_pair_coordinates() {
        let session = CalibrationSession::new(QuantScheme::Symmetric, 2, 3).unwrap();
        let coords: Vec<_> = session
            .observer_pairs()
            .map(|(ls, _, _)| (ls.layer, ls.shard))
            .collect();

        assert_eq!(coords, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_no_batches_no_session() {
        let collector = KvStatsCollector::new(QuantScheme::Symmetric, 1).unwrap();
        assert!(collector.into_session().is_none());
    }
}
