//! Online statistics accumulator.

use candle_core::Tensor;

use super::{QuantParams, QuantScheme, Statistic};

/// Accumulates one [`Statistic`] per observed tensor while enabled.
///
/// Observers start disabled; a calibration session enables them right after
/// creation. The buffer only grows.
#[derive(Debug, Clone)]
pub struct Observer {
    scheme: QuantScheme,
    enabled: bool,
    buffer: Vec<Statistic>,
}

impl Observer {
    /// Create a disabled observer reducing with `scheme`
    pub fn new(scheme: QuantScheme) -> Self {
        Self {
            scheme,
            enabled: false,
            buffer: Vec::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Reduce `tensor` and append the result. No-op while disabled.
    pub fn observe(&mut self, tensor: &Tensor) -> crate::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let stat = self.scheme.reduce(tensor)?;
        self.record(stat);
        Ok(())
    }

    /// Append an already reduced statistic. No-op while disabled.
    pub fn record(&mut self, stat: Statistic) {
        if self.enabled {
            self.buffer.push(stat);
        }
    }

    pub fn buffer(&self) -> &[Statistic] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn scheme(&self) -> QuantScheme {
        self.scheme
    }

    /// Reduce the whole buffer to quantization parameters
    pub fn finalize(&self, bits: u8) -> crate::Result<QuantParams> {
        self.scheme.finalize(&self.buffer, bits)
    }
}
