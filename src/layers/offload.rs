//! Device placement of decoder layers.
//!
//! With offload enabled the decoder layers stay in host memory. Each forward
//! call acquires a [`LayerGuard`] that holds a device copy of one layer; the
//! copy is released when the guard drops, on success and on error alike.

use std::ops::Deref;

use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};

use super::{LayerLoader, LayerWeights};
use crate::utils::{clean_memory, format_bytes};
use crate::KvCalibError;

/// Where decoder layers live between forward calls
pub enum LayerPlacement {
    /// Every layer kept on the compute device
    Resident(Vec<LayerWeights>),
    /// Layers kept in host memory, moved to `device` one at a time
    Offloaded {
        host: Vec<LayerWeights>,
        device: Device,
    },
}

impl LayerPlacement {
    /// Load every decoder layer, to the device or to host memory
    pub fn load(loader: &LayerLoader, offload: bool) -> crate::Result<Self> {
        let pb = ProgressBar::new(loader.num_layers() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} Loading layers")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut layers = Vec::with_capacity(loader.num_layers());
        for idx in 0..loader.num_layers() {
            let weights = if offload {
                loader.load_layer_to_cpu(idx)?
            } else {
                loader.load_layer(idx)?
            };
            layers.push(weights);
            pb.inc(1);
        }
        pb.finish_and_clear();

        let total: usize = layers.iter().map(LayerWeights::size_in_bytes).sum();
        tracing::info!(
            "Loaded {} decoder layers ({}) to {}",
            layers.len(),
            format_bytes(total as u64),
            if offload { "host memory" } else { "device" }
        );

        Ok(if offload {
            LayerPlacement::Offloaded {
                host: layers,
                device: loader.device().clone(),
            }
        } else {
            LayerPlacement::Resident(layers)
        })
    }

    pub fn is_offloaded(&self) -> bool {
        matches!(self, LayerPlacement::Offloaded { .. })
    }

    pub fn num_layers(&self) -> usize {
        match self {
            LayerPlacement::Resident(layers) => layers.len(),
            LayerPlacement::Offloaded { host, .. } => host.len(),
        }
    }

    /// Make layer `idx` available on the compute device for the guard's lifetime
    pub fn acquire(&self, idx: usize) -> crate::Result<LayerGuard<'_>> {
        let out_of_range = || {
            KvCalibError::LayerLoadError(format!(
                "Layer index {} out of range ({} layers)",
                idx,
                self.num_layers()
            ))
        };

        match self {
            LayerPlacement::Resident(layers) => {
                Ok(LayerGuard::Resident(layers.get(idx).ok_or_else(out_of_range)?))
            }
            LayerPlacement::Offloaded { host, device } => {
                let weights = host.get(idx).ok_or_else(out_of_range)?;
                tracing::trace!("Moving layer {} to {:?}", idx, device);
                Ok(LayerGuard::OnDevice(weights.to_device(device)?))
            }
        }
    }
}

/// Scoped access to one decoder layer on the compute device
pub enum LayerGuard<'a> {
    Resident(&'a LayerWeights),
    /// Temporary device copy, freed on drop
    OnDevice(LayerWeights),
}

impl Deref for LayerGuard<'_> {
    type Target = LayerWeights;

    fn deref(&self) -> &LayerWeights {
        match self {
            LayerGuard::Resident(weights) => *weights,
            LayerGuard::OnDevice(weights) => weights,
        }
    }
}

impl Drop for LayerGuard<'_> {
    fn drop(&mut self) {
        if let LayerGuard::OnDevice(weights) = self {
            tracing::trace!("Releasing device copy of layer {}", weights.layer_idx);
            weights.tensors.clear();
            clean_memory();
        }
    }
}
