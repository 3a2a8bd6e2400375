//! Reductions applied to each observed KV cache shard.

use candle_core::{DType, Tensor};

use crate::KvCalibError;

/// One reduced observation, as stored in an [`Observer`](super::Observer) buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    /// Maximum absolute value (symmetric)
    AbsMax(f32),
    /// Elementwise minimum and maximum (asymmetric)
    MinMax { min: f32, max: f32 },
}

/// Maximum absolute value in a tensor
pub fn absmax(tensor: &Tensor) -> crate::Result<f32> {
    let flat = flatten_f32(tensor)?;
    let value = flat.abs()?.max(0)?.to_scalar::<f32>()?;
    Ok(value)
}

/// Minimum and maximum value in a tensor
pub fn minmax(tensor: &Tensor) -> crate::Result<(f32, f32)> {
    let flat = flatten_f32(tensor)?;
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    Ok((min, max))
}

/// Validate an observation and flatten it to a 1-D f32 tensor.
fn flatten_f32(tensor: &Tensor) -> crate::Result<Tensor> {
    if tensor.elem_count() == 0 {
        return Err(KvCalibError::InvalidInput(format!(
            "cannot reduce an empty tensor of shape {:?}",
            tensor.dims()
        )));
    }

    match tensor.dtype() {
        DType::F16 | DType::BF16 | DType::F32 | DType::F64 => {}
        other => {
            return Err(KvCalibError::InvalidInput(format!(
                "expected a floating point tensor, got {:?}",
                other
            )));
        }
    }

    let flat = tensor.to_dtype(DType::F32)?.flatten_all()?;

    // NaN is the only value unequal to itself
    let has_nan = flat.ne(&flat)?.max(0)?.to_scalar::<u8>()? != 0;
    let peak = flat.abs()?.max(0)?.to_scalar::<f32>()?;
    if has_nan || !peak.is_finite() {
        return Err(KvCalibError::InvalidInput(format!(
            "observation of shape {:?} holds non-finite values",
            tensor.dims()
        )));
    }

    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_absmax() {
        let t = tensor(&[0.5, -7.25, 3.0, 6.0], &[2, 2]);
        let value = absmax(&t).unwrap();

        assert_eq!(value, 7.25);
        assert!(value >= 0.0);
    }

    #[test]
    fn test_absmax_matches_extremes() {
        let data = [-1.0f32, 0.25, 4.5, -3.5, 2.0, 0.0];
        let t = tensor(&data, &[1, 2, 3]);

        let (min, max) = minmax(&t).unwrap();
        assert_eq!(absmax(&t).unwrap(), min.abs().max(max.abs()));
    }

    #[test]
    fn test_minmax_ordering() {
        let t = tensor(&[2.0, -1.5, 8.0, 0.0], &[4]);
        let (min, max) = minmax(&t).unwrap();

        assert_eq!(min, -1.5);
        assert_eq!(max, 8.0);
        assert!(min <= max);
    }

    #[test]
    fn test_half_precision_input() {
        let t = tensor(&[1.0, -2.0, 0.5], &[3]).to_dtype(DType::F16).unwrap();
        assert_eq!(absmax(&t).unwrap(), 2.0);
    }

    #[test]
    fn test_non_contiguous_input() {
        let t = tensor(&[1.0, 2.0, 3.0, -9.0, 5.0, 6.0], &[2, 3]);
        let col = t.narrow(1, 0, 1).unwrap();
        assert_eq!(minmax(&col).unwrap(), (-9.0, 1.0));
    }

    #[test]
    fn test_empty_input_rejected() {
        let t = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(absmax(&t), Err(KvCalibError::InvalidInput(_))));
        assert!(matches!(minmax(&t), Err(KvCalibError::InvalidInput(_))));
    }

    #[test]
    fn test_integer_input_rejected() {
        let t = Tensor::from_vec(vec![1u32, 2, 3], &[3], &Device::Cpu).unwrap();
        assert!(matches!(absmax(&t), Err(KvCalibError::InvalidInput(_))));
    }

    #[test]
    fn test_non_finite_input_rejected() {
        let inf = tensor(&[1.0, f32::INFINITY], &[2]);
        assert!(matches!(absmax(&inf), Err(KvCalibError::InvalidInput(_))));
        assert!(matches!(minmax(&inf), Err(KvCalibError::InvalidInput(_))));

        let neg_inf = tensor(&[f32::NEG_INFINITY, 0.5], &[2]);
        assert!(matches!(minmax(&neg_inf), Err(KvCalibError::InvalidInput(_))));

        let nan = tensor(&[0.25, f32::NAN, -1.0], &[3]);
        assert!(matches!(absmax(&nan), Err(KvCalibError::InvalidInput(_))));
        assert!(matches!(minmax(&nan), Err(KvCalibError::InvalidInput(_))));
    }
}
