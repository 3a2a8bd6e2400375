//! Calibration corpus loading and batching.

mod loader;

pub use loader::{concat_blocks, document_windows, random_windows, CalibLoader};

use candle_core::{Device, Tensor};

/// Label value ignored by the loss; fills every target but the last
pub const IGNORE_INDEX: i64 = -100;

/// One calibration batch as produced by the corpus loader.
#[derive(Debug, Clone)]
pub enum CalibBatch {
    /// Raw token ids `[1, seq_len]`
    Tokens(Tensor),
    /// Token ids with next-token targets, both `[1, seq_len]`
    Labeled { input_ids: Tensor, targets: Tensor },
}

impl CalibBatch {
    /// Batch of raw token ids
    pub fn tokens(ids: Vec<u32>, device: &Device) -> crate::Result<Self> {
        let len = ids.len();
        Ok(CalibBatch::Tokens(Tensor::from_vec(ids, (1, len), device)?))
    }

    /// Token ids with targets masked to [`IGNORE_INDEX`] except the last position
    pub fn labeled(ids: Vec<u32>, device: &Device) -> crate::Result<Self> {
        let len = ids.len();
        let mut targets = vec![IGNORE_INDEX; len];
        if let Some(last) = ids.last() {
            targets[len - 1] = *last as i64;
        }

        Ok(CalibBatch::Labeled {
            input_ids: Tensor::from_vec(ids, (1, len), device)?,
            targets: Tensor::from_vec(targets, (1, len), device)?,
        })
    }

    /// Token ids fed to the model: the raw tensor, or the first tuple element
    pub fn input_ids(&self) -> &Tensor {
        match self {
            CalibBatch::Tokens(ids) => ids,
            CalibBatch::Labeled { input_ids, .. } => input_ids,
        }
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids().dims().last().copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labeled_targets() {
        let batch = CalibBatch::labeled(vec![5, 6, 7], &Device::Cpu).unwrap();
        assert_eq!(batch.seq_len(), 3);

        match &batch {
            CalibBatch::Labeled { input_ids, targets } => {
                assert_eq!(input_ids.to_vec2::<u32>().unwrap(), vec![vec![5, 6, 7]]);
                assert_eq!(
                    targets.to_vec2::<i64>().unwrap(),
                    vec![vec![IGNORE_INDEX, IGNORE_INDEX, 7]]
                );
            }
            CalibBatch::Tokens(_) => panic!("expected a labeled batch"),
        }
    }

    #[test]
    fn test_input_ids_of_both_kinds() {
        let raw = CalibBatch::tokens(vec![1, 2], &Device::Cpu).unwrap();
        let labeled = CalibBatch::labeled(vec![1, 2], &Device::Cpu).unwrap();

        assert_eq!(
            raw.input_ids().to_vec2::<u32>().unwrap(),
            labeled.input_ids().to_vec2::<u32>().unwrap()
        );
    }
}
