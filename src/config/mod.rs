//! Configuration for calibration runs and model geometry.

mod calib_config;
mod model_config;

pub use calib_config::{CalibConfig, CalibDataset, Granularity, SUPPORTED_BITS};
pub use model_config::{ModelArchitecture, ModelConfig};
