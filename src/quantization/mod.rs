//! Statistics and parameters for int8 KV cache quantization.
//!
//! Two schemes are supported:
//! - Symmetric: zero-centered, a single scale from the running absmax
//! - Asymmetric: scale plus zero-point from the running (min, max)

mod observer;
mod params;
mod reducer;

pub use observer::Observer;
pub use params::{KvQuantParams, QuantParams};
pub use reducer::{absmax, minmax, Statistic};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::KvCalibError;

/// Quantization scheme, selected once per calibration run.
///
/// The scheme owns both halves of the pipeline: how a single observation is
/// reduced and how the accumulated reductions become [`QuantParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantScheme {
    /// absmax reduction, `scale = absmax / (2^(bits-1) - 1)`
    #[default]
    Symmetric,
    /// (min, max) reduction, `scale = (max - min) / (2^bits - 1)`, `zero_point = min`
    Asymmetric,
}

impl QuantScheme {
    /// Map the boolean `symmetry` option onto a scheme
    pub fn from_symmetry(symmetry: bool) -> Self {
        if symmetry {
            QuantScheme::Symmetric
        } else {
            QuantScheme::Asymmetric
        }
    }

    pub fn is_symmetric(&self) -> bool {
        matches!(self, QuantScheme::Symmetric)
    }

    /// Number of f32 values stored per (layer, shard) artifact
    pub fn params_per_file(&self) -> usize {
        match self {
            QuantScheme::Symmetric => 2,
            QuantScheme::Asymmetric => 4,
        }
    }

    /// Reduce one observation to the statistic this scheme accumulates
    pub fn reduce(&self, tensor: &Tensor) -> crate::Result<Statistic> {
        match self {
            QuantScheme::Symmetric => Ok(Statistic::AbsMax(absmax(tensor)?)),
            QuantScheme::Asymmetric => {
                let (min, max) = minmax(tensor)?;
                Ok(Statistic::MinMax { min, max })
            }
        }
    }

    /// Fold an observer buffer into final quantization parameters.
    ///
    /// Returns [`KvCalibError::DegenerateRange`] when the observed range has
    /// zero width; callers decide how to recover.
    pub fn finalize(&self, buffer: &[Statistic], bits: u8) -> crate::Result<QuantParams> {
        if buffer.is_empty() {
            return Err(KvCalibError::ConsistencyError(
                "observer recorded no statistics".to_string(),
            ));
        }

        match self {
            QuantScheme::Symmetric => {
                let mut absmax = 0.0f32;
                for stat in buffer {
                    match stat {
                        Statistic::AbsMax(v) => absmax = absmax.max(*v),
                        Statistic::MinMax { .. } => return Err(mixed_buffer(*self)),
                    }
                }
                QuantParams::symmetric(absmax, bits)
            }
            QuantScheme::Asymmetric => {
                let mut min = f32::INFINITY;
                let mut max = f32::NEG_INFINITY;
                for stat in buffer {
                    match stat {
                        Statistic::MinMax { min: lo, max: hi } => {
                            min = min.min(*lo);
                            max = max.max(*hi);
                        }
                        Statistic::AbsMax(_) => return Err(mixed_buffer(*self)),
                    }
                }
                QuantParams::asymmetric(min, max, bits)
            }
        }
    }
}

impl std::fmt::Display for QuantScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuantScheme::Symmetric => write!(f, "symmetric"),
            QuantScheme::Asymmetric => write!(f, "asymmetric"),
        }
    }
}

fn mixed_buffer(scheme: QuantScheme) -> KvCalibError {
    KvCalibError::ConsistencyError(format!(
        "observer buffer holds statistics of a different scheme than {}",
        scheme
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_symmetric_finalize() {
        let buffer = vec![
            Statistic::AbsMax(3.0),
            Statistic::AbsMax(5.0),
            Statistic::AbsMax(2.0),
        ];
        let params = QuantScheme::Symmetric.finalize(&buffer, 8).unwrap();

        assert!((params.scale - 5.0 / 127.0).abs() < 1e-9);
        assert_eq!(params.zero_point, None);
    }

    #[test]
    fn test_asymmetric_finalize() {
        let buffer = vec![
            Statistic::MinMax { min: -2.0, max: 4.0 },
            Statistic::MinMax { min: -5.0, max: 3.0 },
        ];
        let params = QuantScheme::Asymmetric.finalize(&buffer, 8).unwrap();

        assert!((params.scale - 9.0 / 255.0).abs() < 1e-9);
        assert_eq!(params.zero_point, Some(-5.0));
    }

    #[test]
    fn test_finalize_rejects_mixed_buffer() {
        let buffer = vec![Statistic::AbsMax(1.0)];
        assert!(matches!(
            QuantScheme::Asymmetric.finalize(&buffer, 8),
            Err(KvCalibError::ConsistencyError(_))
        ));
    }

    #[test]
    fn test_finalize_empty_buffer() {
        assert!(matches!(
            QuantScheme::Symmetric.finalize(&[], 8),
            Err(KvCalibError::ConsistencyError(_))
        ));
    }

    #[test]
    fn test_zero_range_is_degenerate() {
        let buffer = vec![Statistic::MinMax { min: 1.5, max: 1.5 }];
        assert!(matches!(
            QuantScheme::Asymmetric.finalize(&buffer, 8),
            Err(KvCalibError::DegenerateRange { .. })
        ));

        let buffer = vec![Statistic::AbsMax(0.0)];
        assert!(matches!(
            QuantScheme::Symmetric.finalize(&buffer, 8),
            Err(KvCalibError::DegenerateRange { .. })
        ));
    }

    #[test]
    fn test_reduce_matches_scheme() {
        let tensor = Tensor::from_vec(vec![-3.0f32, 1.0, 2.5], &[3], &Device::Cpu).unwrap();

        assert_eq!(
            QuantScheme::Symmetric.reduce(&tensor).unwrap(),
            Statistic::AbsMax(3.0)
        );
        assert_eq!(
            QuantScheme::Asymmetric.reduce(&tensor).unwrap(),
            Statistic::MinMax { min: -3.0, max: 2.5 }
        );
    }

    #[test]
    fn test_from_symmetry() {
        assert_eq!(QuantScheme::from_symmetry(true), QuantScheme::Symmetric);
        assert_eq!(QuantScheme::from_symmetry(false), QuantScheme::Asymmetric);
        assert_eq!(QuantScheme::Asymmetric.params_per_file(), 4);
    }
}
