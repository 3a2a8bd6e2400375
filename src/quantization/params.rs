//! Quantization parameters and their on-disk encoding.
//!
//! Consumer contract:
//! - symmetric: `q = round(x / scale)`, `x ≈ q * scale`
//! - asymmetric: `q = round((x - zero_point) / scale)`, `x ≈ q * scale + zero_point`

use candle_core::{DType, Tensor};

use super::QuantScheme;
use crate::KvCalibError;

/// Scale (and optional zero-point) for one tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    /// Step between adjacent quantized values
    pub scale: f32,
    /// Offset added after dequantization (asymmetric only)
    pub zero_point: Option<f32>,
    /// Integer bit width
    pub bits: u8,
}

impl QuantParams {
    /// Symmetric parameters from an absolute maximum
    pub fn symmetric(absmax: f32, bits: u8) -> crate::Result<Self> {
        check_bits(bits)?;
        let qmax = ((1u32 << (bits - 1)) - 1) as f32;

        if !absmax.is_finite() {
            return Err(KvCalibError::InvalidInput(format!(
                "absmax {} is not finite",
                absmax
            )));
        }
        if absmax == 0.0 {
            return Err(KvCalibError::DegenerateRange {
                min: -absmax,
                max: absmax,
            });
        }

        Ok(Self {
            scale: absmax / qmax,
            zero_point: None,
            bits,
        })
    }

    /// Asymmetric parameters from an observed (min, max) range
    pub fn asymmetric(min: f32, max: f32, bits: u8) -> crate::Result<Self> {
        check_bits(bits)?;
        let levels = ((1u32 << bits) - 1) as f32;

        if !(max - min).is_finite() {
            return Err(KvCalibError::InvalidInput(format!(
                "range [{}, {}] is not finite",
                min, max
            )));
        }
        if max <= min {
            return Err(KvCalibError::DegenerateRange { min, max });
        }

        Ok(Self {
            scale: (max - min) / levels,
            zero_point: Some(min),
            bits,
        })
    }

    /// Fallback for a zero-width range: smallest positive normal scale.
    ///
    /// Values equal to the observed constant still round-trip exactly.
    pub fn min_scale(scheme: QuantScheme, zero_point: f32, bits: u8) -> Self {
        Self {
            scale: f32::MIN_POSITIVE,
            zero_point: match scheme {
                QuantScheme::Symmetric => None,
                QuantScheme::Asymmetric => Some(zero_point),
            },
            bits,
        }
    }

    pub fn scheme(&self) -> QuantScheme {
        if self.zero_point.is_some() {
            QuantScheme::Asymmetric
        } else {
            QuantScheme::Symmetric
        }
    }

    /// Inclusive range of the quantized integers
    pub fn quant_range(&self) -> (i32, i32) {
        match self.zero_point {
            None => {
                let qmax = (1i32 << (self.bits - 1)) - 1;
                (-qmax, qmax)
            }
            Some(_) => (0, (1i32 << self.bits) - 1),
        }
    }

    /// Quantize a single value
    pub fn quantize(&self, value: f32) -> i32 {
        let (qmin, qmax) = self.quant_range();
        let shifted = value - self.zero_point.unwrap_or(0.0);
        let q = (shifted / self.scale).round();
        q.clamp(qmin as f32, qmax as f32) as i32
    }

    /// Dequantize a single value
    pub fn dequantize(&self, quantized: i32) -> f32 {
        quantized as f32 * self.scale + self.zero_point.unwrap_or(0.0)
    }

    /// Quantize a whole tensor; the result holds integers as I64
    pub fn quantize_tensor(&self, tensor: &Tensor) -> crate::Result<Tensor> {
        let (qmin, qmax) = self.quant_range();
        let zero_point = self.zero_point.unwrap_or(0.0) as f64;
        let scale = self.scale as f64;

        let q = tensor
            .to_dtype(DType::F32)?
            .affine(1.0 / scale, -zero_point / scale)?
            .round()?
            .clamp(qmin as f32, qmax as f32)?;

        Ok(q.to_dtype(DType::I64)?)
    }

    /// Dequantize a tensor produced by [`quantize_tensor`](Self::quantize_tensor)
    pub fn dequantize_tensor(&self, quantized: &Tensor) -> crate::Result<Tensor> {
        let zero_point = self.zero_point.unwrap_or(0.0) as f64;
        let x = quantized
            .to_dtype(DType::F32)?
            .affine(self.scale as f64, zero_point)?;
        Ok(x)
    }
}

fn check_bits(bits: u8) -> crate::Result<()> {
    if !(2..=16).contains(&bits) {
        return Err(KvCalibError::ConfigError(format!(
            "bit width {} is outside 2..=16",
            bits
        )));
    }
    Ok(())
}

/// Key and value parameters for one (layer, shard).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KvQuantParams {
    Symmetric {
        k_scale: f32,
        v_scale: f32,
    },
    Asymmetric {
        k_scale: f32,
        k_zero_point: f32,
        v_scale: f32,
        v_zero_point: f32,
    },
}

impl KvQuantParams {
    /// Combine key and value parameters of the same scheme
    pub fn from_pair(key: QuantParams, value: QuantParams) -> crate::Result<Self> {
        match (key.zero_point, value.zero_point) {
            (None, None) => Ok(KvQuantParams::Symmetric {
                k_scale: key.scale,
                v_scale: value.scale,
            }),
            (Some(k_zero_point), Some(v_zero_point)) => Ok(KvQuantParams::Asymmetric {
                k_scale: key.scale,
                k_zero_point,
                v_scale: value.scale,
                v_zero_point,
            }),
            _ => Err(KvCalibError::ConsistencyError(
                "key and value parameters use different schemes".to_string(),
            )),
        }
    }

    pub fn scheme(&self) -> QuantScheme {
        match self {
            KvQuantParams::Symmetric { .. } => QuantScheme::Symmetric,
            KvQuantParams::Asymmetric { .. } => QuantScheme::Asymmetric,
        }
    }

    /// Key parameters at the given bit width
    pub fn key(&self, bits: u8) -> QuantParams {
        match *self {
            KvQuantParams::Symmetric { k_scale, .. } => QuantParams {
                scale: k_scale,
                zero_point: None,
                bits,
            },
            KvQuantParams::Asymmetric {
                k_scale,
                k_zero_point,
                ..
            } => QuantParams {
                scale: k_scale,
                zero_point: Some(k_zero_point),
                bits,
            },
        }
    }

    /// Value parameters at the given bit width
    pub fn value(&self, bits: u8) -> QuantParams {
        match *self {
            KvQuantParams::Symmetric { v_scale, .. } => QuantParams {
                scale: v_scale,
                zero_point: None,
                bits,
            },
            KvQuantParams::Asymmetric {
                v_scale,
                v_zero_point,
                ..
            } => QuantParams {
                scale: v_scale,
                zero_point: Some(v_zero_point),
                bits,
            },
        }
    }

    /// Values in file order
    pub fn to_vec(&self) -> Vec<f32> {
        match *self {
            KvQuantParams::Symmetric { k_scale, v_scale } => vec![k_scale, v_scale],
            KvQuantParams::Asymmetric {
                k_scale,
                k_zero_point,
                v_scale,
                v_zero_point,
            } => vec![k_scale, k_zero_point, v_scale, v_zero_point],
        }
    }

    /// Headerless little-endian f32 encoding read by the serving engine
    pub fn to_bytes(&self) -> Vec<u8> {
        let values = self.to_vec();
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Decode an artifact. The encoding carries no scheme tag, so the caller
    /// must supply it; a length that does not fit the scheme is rejected.
    pub fn from_bytes(bytes: &[u8], scheme: QuantScheme) -> crate::Result<Self> {
        let expected = scheme.params_per_file() * 4;
        if bytes.len() != expected {
            return Err(KvCalibError::InvalidInput(format!(
                "{} parameters need {} bytes, got {}",
                scheme,
                expected,
                bytes.len()
            )));
        }

        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Ok(match scheme {
            QuantScheme::Symmetric => KvQuantParams::Symmetric {
                k_scale: values[0],
                v_scale: values[1],
            },
            QuantScheme::Asymmetric => KvQuantParams::Asymmetric {
                k_scale: values[0],
                k_zero_point: values[1],
                v_scale: values[2],
                v_zero_point: values[3],
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_symmetric_roundtrip_error_bound() {
        let params = QuantParams::symmetric(2.0, 8).unwrap();
        let half_step = params.scale / 2.0 + 1e-6;

        for i in 0..=400 {
            let v = -2.0 + i as f32 * 0.01;
            let restored = params.dequantize(params.quantize(v));
            assert!(
                (restored - v).abs() <= half_step,
                "{} -> {} (diff {})",
                v,
                restored,
                (restored - v).abs()
            );
        }
    }

    #[test]
    fn test_asymmetric_roundtrip_error_bound() {
        let params = QuantParams::asymmetric(-5.0, 4.0, 8).unwrap();
        let half_step = params.scale / 2.0 + 1e-6;

        for i in 0..=900 {
            let v = -5.0 + i as f32 * 0.01;
            let q = params.quantize(v);
            assert!((0..=255).contains(&q));
            assert!((params.dequantize(q) - v).abs() <= half_step);
        }
    }

    #[test]
    fn test_quantize_clamps_out_of_range() {
        let params = QuantParams::symmetric(1.0, 8).unwrap();
        assert_eq!(params.quantize(10.0), 127);
        assert_eq!(params.quantize(-10.0), -127);

        let params = QuantParams::asymmetric(0.0, 1.0, 8).unwrap();
        assert_eq!(params.quantize(-3.0), 0);
        assert_eq!(params.quantize(3.0), 255);
    }

    #[test]
    fn test_tensor_roundtrip() {
        let data = vec![0.1f32, -0.5, 0.8, -0.2, 0.0, 0.3, -0.7, 0.9];
        let tensor = Tensor::from_vec(data.clone(), &[2, 4], &Device::Cpu).unwrap();
        let params = QuantParams::asymmetric(-0.7, 0.9, 8).unwrap();

        let q = params.quantize_tensor(&tensor).unwrap();
        assert_eq!(q.dtype(), DType::I64);
        assert_eq!(q.dims(), &[2, 4]);

        let restored: Vec<f32> = params
            .dequantize_tensor(&q)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for (orig, rest) in data.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= params.scale / 2.0 + 1e-5);
        }
    }

    #[test]
    fn test_unsupported_bits() {
        assert!(matches!(
            QuantParams::symmetric(1.0, 1),
            Err(KvCalibError::ConfigError(_))
        ));
        assert!(matches!(
            QuantParams::asymmetric(0.0, 1.0, 17),
            Err(KvCalibError::ConfigError(_))
        ));
    }

    #[test]
    fn test_non_finite_range_is_invalid() {
        assert!(matches!(
            QuantParams::symmetric(f32::INFINITY, 8),
            Err(KvCalibError::InvalidInput(_))
        ));
        assert!(matches!(
            QuantParams::symmetric(f32::NAN, 8),
            Err(KvCalibError::InvalidInput(_))
        ));
        assert!(matches!(
            QuantParams::asymmetric(-1.0, f32::INFINITY, 8),
            Err(KvCalibError::InvalidInput(_))
        ));
        assert!(matches!(
            QuantParams::asymmetric(2.0, 2.0, 8),
            Err(KvCalibError::DegenerateRange { .. })
        ));
    }

    #[test]
    fn test_min_scale_fallback() {
        let params = QuantParams::min_scale(QuantScheme::Asymmetric, 3.0, 8);
        assert_eq!(params.scale, f32::MIN_POSITIVE);
        assert_eq!(params.dequantize(params.quantize(3.0)), 3.0);
        assert!(params.scale > 0.0);
    }

    #[test]
    fn test_symmetric_layout() {
        let params = KvQuantParams::Symmetric {
            k_scale: 0.5,
            v_scale: 0.25,
        };
        let bytes = params.to_bytes();

        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], &0.5f32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0.25f32.to_le_bytes());
        assert_eq!(
            KvQuantParams::from_bytes(&bytes, QuantScheme::Symmetric).unwrap(),
            params
        );
    }

    #[test]
    fn test_asymmetric_layout() {
        let params = KvQuantParams::Asymmetric {
            k_scale: 0.1,
            k_zero_point: -5.0,
            v_scale: 0.2,
            v_zero_point: -1.0,
        };
        let bytes = params.to_bytes();

        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], &(-5.0f32).to_le_bytes());
        assert_eq!(&bytes[12..16], &(-1.0f32).to_le_bytes());
    }

    #[test]
    fn test_scheme_must_match_length() {
        let bytes = KvQuantParams::Symmetric {
            k_scale: 1.0,
            v_scale: 1.0,
        }
        .to_bytes();

        assert!(matches!(
            KvQuantParams::from_bytes(&bytes, QuantScheme::Asymmetric),
            Err(KvCalibError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_pair_rejects_mixed() {
        let key = QuantParams::symmetric(1.0, 8).unwrap();
        let value = QuantParams::asymmetric(0.0, 1.0, 8).unwrap();
        assert!(KvQuantParams::from_pair(key, value).is_err());

        let pair = KvQuantParams::from_pair(key, key).unwrap();
        assert_eq!(pair.scheme(), QuantScheme::Symmetric);
        assert_eq!(pair.key(8), key);
    }
}
