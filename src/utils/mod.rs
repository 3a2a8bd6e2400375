//! Utility modules for device management, downloads, and memory.

mod device;
mod download;
mod memory;

pub use device::{default_dtype, get_device, is_cpu, Device, DType};
pub use download::{download_model, ensure_model_files, model_cache_dir};
pub use memory::{clean_memory, format_bytes};
