//! Finalization of observer statistics and the KV parameter artifacts.
//!
//! One file per (layer, shard), named `layers.<layer>.past_kv_scale.<shard>.weight`,
//! containing headerless little-endian f32 values:
//!
//! ```text
//! symmetric:  [k_scale, v_scale]                               (8 bytes)
//! asymmetric: [k_scale, k_zero_point, v_scale, v_zero_point]   (16 bytes)
//! ```
//!
//! The files do not say which layout they use. A `kv_qparams.json` manifest
//! is written next to them so readers never have to guess from the size.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::CalibrationSession;
use crate::config::Granularity;
use crate::quantization::{KvQuantParams, Observer, QuantParams, QuantScheme};
use crate::KvCalibError;

/// Sidecar manifest file name
pub const MANIFEST_FILE: &str = "kv_qparams.json";

const FILE_PREFIX: &str = "layers.";
const FILE_INFIX: &str = ".past_kv_scale.";
const FILE_SUFFIX: &str = ".weight";

/// Coordinates of one observer pair / artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerShard {
    pub layer: usize,
    pub shard: usize,
}

impl LayerShard {
    /// Coordinates of flat observer index `index`
    pub fn from_index(index: usize, num_tp: usize) -> Self {
        Self {
            layer: index / num_tp,
            shard: index % num_tp,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}{}{}",
            FILE_PREFIX, self.layer, FILE_INFIX, self.shard, FILE_SUFFIX
        )
    }

    /// Inverse of [`file_name`](Self::file_name)
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
        let (layer, shard) = rest.split_once(FILE_INFIX)?;
        Some(Self {
            layer: layer.parse().ok()?,
            shard: shard.parse().ok()?,
        })
    }

    /// Coordinates encoded in an artifact path's file name
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(Self::parse_file_name)
            .ok_or_else(|| {
                KvCalibError::InvalidInput(format!(
                    "{:?} is not named layers.<layer>.past_kv_scale.<shard>.weight",
                    path
                ))
            })
    }
}

/// Out-of-band description of an artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvParamsManifest {
    pub scheme: QuantScheme,
    pub bits: u8,
    pub granularity: Granularity,
    pub num_layers: usize,
    pub num_tp: usize,
}

impl KvParamsManifest {
    pub fn write(&self, dir: impl AsRef<Path>) -> crate::Result<PathBuf> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }

    pub fn read(dir: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(dir.as_ref().join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Result of [`export_kv_qparams`]
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub scheme: QuantScheme,
    pub bits: u8,
    /// Artifact paths in (layer, shard) order
    pub files: Vec<PathBuf>,
    /// Pairs where a zero-width range was clamped to the minimal scale
    pub degenerate: Vec<LayerShard>,
}

/// Finalize one observer, clamping a zero-width range instead of failing
fn finalize_observer(
    observer: &Observer,
    bits: u8,
    coords: LayerShard,
    which: &str,
) -> crate::Result<(QuantParams, bool)> {
    match observer.finalize(bits) {
        Ok(params) => Ok((params, false)),
        Err(KvCalibError::DegenerateRange { min, max }) => {
            tracing::warn!(
                "Layer {} TP {} {} range [{}, {}] is degenerate, using minimal scale",
                coords.layer,
                coords.shard,
                which,
                min,
                max
            );
            Ok((QuantParams::min_scale(observer.scheme(), min, bits), true))
        }
        Err(e) => Err(e),
    }
}

/// Final parameters of one key/value observer pair, plus whether either
/// side had to be clamped.
pub fn finalize_pair(
    k_observer: &Observer,
    v_observer: &Observer,
    bits: u8,
    coords: LayerShard,
) -> crate::Result<(KvQuantParams, bool)> {
    let (key, k_degenerate) = finalize_observer(k_observer, bits, coords, "key")?;
    let (value, v_degenerate) = finalize_observer(v_observer, bits, coords, "value")?;
    Ok((
        KvQuantParams::from_pair(key, value)?,
        k_degenerate || v_degenerate,
    ))
}

/// Final parameters for every (layer, shard) of a session, without writing
pub fn finalize_session(
    session: &CalibrationSession,
    bits: u8,
) -> crate::Result<Vec<(LayerShard, KvQuantParams)>> {
    session
        .observer_pairs()
        .map(|(coords, k, v)| finalize_pair(k, v, bits, coords).map(|(params, _)| (coords, params)))
        .collect()
}

/// Write one artifact
pub fn write_kv_qparams(path: impl AsRef<Path>, params: &KvQuantParams) -> crate::Result<()> {
    std::fs::write(path, params.to_bytes())?;
    Ok(())
}

/// Read one artifact with an explicitly known scheme
pub fn read_kv_qparams(path: impl AsRef<Path>, scheme: QuantScheme) -> crate::Result<KvQuantParams> {
    let bytes = std::fs::read(path)?;
    KvQuantParams::from_bytes(&bytes, scheme)
}

/// Read every artifact in `dir`, sorted by (layer, shard).
///
/// The scheme comes from `scheme` or, failing that, the manifest.
pub fn read_kv_qparams_dir(
    dir: impl AsRef<Path>,
    scheme: Option<QuantScheme>,
) -> crate::Result<Vec<(LayerShard, KvQuantParams)>> {
    let dir = dir.as_ref();
    let scheme = match scheme {
        Some(scheme) => scheme,
        None => {
            if !dir.join(MANIFEST_FILE).exists() {
                return Err(KvCalibError::ConfigError(format!(
                    "no {} in {:?}; the quantization scheme must be given explicitly",
                    MANIFEST_FILE, dir
                )));
            }
            KvParamsManifest::read(dir)?.scheme
        }
    };

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let coords = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(LayerShard::parse_file_name);

        if let Some(coords) = coords {
            entries.push((coords, read_kv_qparams(&path, scheme)?));
        }
    }

    entries.sort_by_key(|(coords, _)| *coords);
    Ok(entries)
}

/// Finalize every observer pair of `session` and write its artifact to
/// `output_dir` as soon as it is computed, then write the manifest.
pub fn export_kv_qparams(
    session: &CalibrationSession,
    bits: u8,
    output_dir: impl AsRef<Path>,
) -> crate::Result<ExportSummary> {
    let output_dir = output_dir.as_ref();
    std::fs::create_dir_all(output_dir)?;

    let scheme = session.scheme();
    let mut files = Vec::with_capacity(session.k_observers().len());
    let mut degenerate = Vec::new();

    for (coords, k_observer, v_observer) in session.observer_pairs() {
        let (params, clamped) = finalize_pair(k_observer, v_observer, bits, coords)?;
        if clamped {
            degenerate.push(coords);
        }

        let path = output_dir.join(coords.file_name());
        write_kv_qparams(&path, &params)?;
        tracing::debug!("Wrote {:?}: {:?}", path, params.to_vec());

        match scheme {
            QuantScheme::Symmetric => {
                tracing::info!("Layer {} TP {} KV scales done.", coords.layer, coords.shard)
            }
            QuantScheme::Asymmetric => tracing::info!(
                "Layer {} TP {} KV scales&zeros done.",
                coords.layer,
                coords.shard
            ),
        }

        files.push(path);
    }

    let manifest = KvParamsManifest {
        scheme,
        bits,
        granularity: Granularity::PerTensor,
        num_layers: session.num_layers(),
        num_tp: session.num_tp(),
    };
    manifest.write(output_dir)?;

    Ok(ExportSummary {
        scheme,
        bits,
        files,
        degenerate,
    })
}
