//! Calibration run settings.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::quantization::QuantScheme;
use crate::KvCalibError;

/// Bit widths the serving engine can consume
pub const SUPPORTED_BITS: &[u8] = &[8];

/// Granularity of the quantization parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// One scale (and zero-point) per (layer, shard) for all keys, one for all values
    #[default]
    PerTensor,
}

impl FromStr for Granularity {
    type Err = KvCalibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per_tensor" => Ok(Granularity::PerTensor),
            other => Err(KvCalibError::ConfigError(format!(
                "granularity '{}' is not supported, only per-tensor quantization is available for the kv cache",
                other
            ))),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::PerTensor => write!(f, "per_tensor"),
        }
    }
}

/// Calibration corpora
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibDataset {
    #[default]
    C4,
    Ptb,
    Wikitext2,
    Pileval,
}

impl CalibDataset {
    pub const ALL: [CalibDataset; 4] = [
        CalibDataset::C4,
        CalibDataset::Ptb,
        CalibDataset::Wikitext2,
        CalibDataset::Pileval,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CalibDataset::C4 => "c4",
            CalibDataset::Ptb => "ptb",
            CalibDataset::Wikitext2 => "wikitext2",
            CalibDataset::Pileval => "pileval",
        }
    }

    /// JSON lines with a `text` field (otherwise plain text)
    pub fn is_jsonl(&self) -> bool {
        matches!(self, CalibDataset::C4 | CalibDataset::Pileval)
    }

    /// File looked up under `./calib_data` when no path is given
    pub fn default_file_name(&self) -> String {
        let ext = if self.is_jsonl() { "jsonl" } else { "txt" };
        format!("{}.{}", self.name(), ext)
    }
}

impl FromStr for CalibDataset {
    type Err = KvCalibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CalibDataset::ALL
            .iter()
            .copied()
            .find(|d| d.name() == s)
            .ok_or_else(|| {
                KvCalibError::ConfigError(format!(
                    "calibration dataset '{}' is not supported, use `c4`, `ptb`, `wikitext2`, or `pileval`",
                    s
                ))
            })
    }
}

impl fmt::Display for CalibDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Settings of one calibration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibConfig {
    /// Local model directory or HuggingFace model ID
    pub model: String,

    /// Quantization bit width
    #[serde(default = "default_bits")]
    pub bits: u8,

    #[serde(default)]
    pub granularity: Granularity,

    /// Symmetric (absmax) or asymmetric (min/max)
    #[serde(default)]
    pub scheme: QuantScheme,

    /// Keep decoder layers off the device between forward calls
    #[serde(default)]
    pub offload: bool,

    /// Tokens per calibration sample
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Tensor-parallel shards to produce parameters for
    #[serde(default = "default_num_tp")]
    pub num_tp: usize,

    #[serde(default)]
    pub calib_dataset: CalibDataset,

    /// Number of calibration samples
    #[serde(default = "default_calib_samples")]
    pub calib_samples: usize,

    /// Directory receiving the per-(layer, shard) files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Corpus file; defaults to `./calib_data/<dataset file>`
    #[serde(default)]
    pub data_path: Option<PathBuf>,

    /// Seed for calibration sample selection
    #[serde(default)]
    pub seed: u64,
}

fn default_bits() -> u8 {
    8
}

fn default_max_seq_len() -> usize {
    2048
}

fn default_num_tp() -> usize {
    1
}

fn default_calib_samples() -> usize {
    128
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./kv_scales")
}

impl CalibConfig {
    /// Default settings for `model`
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            bits: default_bits(),
            granularity: Granularity::default(),
            scheme: QuantScheme::default(),
            offload: false,
            max_seq_len: default_max_seq_len(),
            num_tp: default_num_tp(),
            calib_dataset: CalibDataset::default(),
            calib_samples: default_calib_samples(),
            output_dir: default_output_dir(),
            data_path: None,
            seed: 0,
        }
    }

    /// Load settings from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CalibConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Reject unsupported combinations before any work begins
    pub fn validate(&self) -> crate::Result<()> {
        if !SUPPORTED_BITS.contains(&self.bits) {
            return Err(KvCalibError::ConfigError(format!(
                "{}-bit kv cache quantization is not supported, only 8-bit",
                self.bits
            )));
        }
        if self.num_tp == 0 {
            return Err(KvCalibError::ConfigError(
                "num_tp must be at least 1".to_string(),
            ));
        }
        if self.max_seq_len == 0 {
            return Err(KvCalibError::ConfigError(
                "max_seq_len must be at least 1".to_string(),
            ));
        }
        if self.calib_samples == 0 {
            return Err(KvCalibError::ConfigError(
                "calib_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Corpus file to read
    pub fn resolved_data_path(&self) -> PathBuf {
        self.data_path.clone().unwrap_or_else(|| {
            PathBuf::from("calib_data").join(self.calib_dataset.default_file_name())
        })
    }
}
