//! Tensor-parallel sharding of the KV cache head axis.

use std::ops::Range;

use candle_core::Tensor;

use crate::KvCalibError;

/// Head axis of a `[batch, heads, tokens, head_dim]` cache tensor
pub const HEAD_AXIS: usize = 1;

/// Splits a layer's cache into `num_tp` contiguous head shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSplitter {
    num_tp: usize,
}

impl ShardSplitter {
    /// Create a splitter for `num_tp` tensor-parallel ranks
    pub fn new(num_tp: usize) -> crate::Result<Self> {
        if num_tp == 0 {
            return Err(KvCalibError::ConfigError(
                "num_tp must be at least 1".to_string(),
            ));
        }
        Ok(Self { num_tp })
    }

    pub fn num_tp(&self) -> usize {
        self.num_tp
    }

    /// Heads owned by each shard
    pub fn heads_per_shard(&self, total_heads: usize) -> crate::Result<usize> {
        if total_heads == 0 || total_heads % self.num_tp != 0 {
            return Err(KvCalibError::ConsistencyError(format!(
                "{} attention heads cannot be split evenly across {} shards",
                total_heads, self.num_tp
            )));
        }
        Ok(total_heads / self.num_tp)
    }

    /// Half-open head range of every shard, in shard order
    pub fn head_ranges(&self, total_heads: usize) -> crate::Result<Vec<Range<usize>>> {
        let per_tp_heads = self.heads_per_shard(total_heads)?;
        Ok((0..self.num_tp)
            .map(|shard| shard * per_tp_heads..(shard + 1) * per_tp_heads)
            .collect())
    }

    /// Slice a `[batch, heads, tokens, head_dim]` tensor into per-shard views
    pub fn split(&self, cache: &Tensor) -> crate::Result<Vec<Tensor>> {
        if cache.rank() != 4 {
            return Err(KvCalibError::ConsistencyError(format!(
                "expected a [batch, heads, tokens, head_dim] cache, got shape {:?}",
                cache.dims()
            )));
        }

        let total_heads = cache.dim(HEAD_AXIS)?;
        self.head_ranges(total_heads)?
            .into_iter()
            .map(|range| {
                cache
                    .narrow(HEAD_AXIS, range.start, range.len())
                    .map_err(Into::into)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_ranges_cover_head_axis() {
        for (heads, num_tp) in [(8, 1), (8, 2), (8, 4), (32, 8), (6, 3)] {
            let ranges = ShardSplitter::new(num_tp).unwrap().head_ranges(heads).unwrap();

            assert_eq!(ranges.len(), num_tp);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges[num_tp - 1].end, heads);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }

    #[test]
    fn test_uneven_split_rejected() {
        let splitter = ShardSplitter::new(3).unwrap();
        assert!(matches!(
            splitter.head_ranges(8),
            Err(KvCalibError::ConsistencyError(_))
        ));
    }

    #[test]
    fn test_zero_shards_rejected() {
        assert!(matches!(
            ShardSplitter::new(0),
            Err(KvCalibError::ConfigError(_))
        ));
    }

    #[test]
    fn test_split_reconstructs_cache() {
        let data: Vec<f32> = (0..2 * 4 * 3 * 2).map(|i| i as f32).collect();
        let cache = Tensor::from_vec(data, &[2, 4, 3, 2], &Device::Cpu).unwrap();

        let shards = ShardSplitter::new(2).unwrap().split(&cache).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[0].dims(), &[2, 2, 3, 2]);

        let rebuilt = Tensor::cat(&shards, HEAD_AXIS).unwrap();
        let diff = (rebuilt - &cache)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn test_split_requires_rank_four() {
        let cache = Tensor::zeros((4, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(ShardSplitter::new(2).unwrap().split(&cache).is_err());
    }
}
