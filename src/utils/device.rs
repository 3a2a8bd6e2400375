//! Device and data type utilities.

use candle_core::{Device as CandleDevice, DType as CandleDType};

/// Re-export candle Device for convenience
pub type Device = CandleDevice;

/// Re-export candle DType for convenience
pub type DType = CandleDType;

/// Get the best available device (CUDA > Metal > CPU)
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    #[cfg(feature = "cuda")]
    {
        let id = device_id.unwrap_or(0);
        match CandleDevice::new_cuda(id) {
            Ok(device) => {
                tracing::info!("Using CUDA device {}", id);
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("CUDA not available: {}", e);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match CandleDevice::new_metal(device_id.unwrap_or(0)) {
            Ok(device) => {
                tracing::info!("Using Metal device");
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("Metal not available: {}", e);
            }
        }
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    {
        if let Some(id) = device_id {
            tracing::warn!("Device {} requested but no GPU backend is compiled in", id);
        }
    }

    tracing::info!("Using CPU device");
    Ok(CandleDevice::Cpu)
}

/// Working precision for a device: F32 on CPU, F16 on accelerators
pub fn default_dtype(device: &Device) -> DType {
    if is_cpu(device) {
        CandleDType::F32
    } else {
        CandleDType::F16
    }
}

/// Check if a device is CPU
pub fn is_cpu(device: &Device) -> bool {
    matches!(device, Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_defaults() {
        assert!(is_cpu(&Device::Cpu));
        assert_eq!(default_dtype(&Device::Cpu), DType::F32);
    }
}
