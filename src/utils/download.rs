//! Model download from the HuggingFace Hub.
//!
//! Calibration only needs the model geometry, the tokenizer and the
//! safetensors weights, so nothing else is fetched.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::KvCalibError;

const HF_BASE: &str = "https://huggingface.co";

/// Files a local model directory must contain
const REQUIRED_FILES: &[&str] = &["config.json", "tokenizer.json"];

/// Download a model from HuggingFace Hub
///
/// # Arguments
/// * `model_id` - HuggingFace model ID (e.g., "meta-llama/Llama-2-7b-hf")
/// * `cache_dir` - Local cache directory
/// * `token` - Optional HuggingFace token for gated models
pub async fn download_model(
    model_id: &str,
    cache_dir: impl AsRef<Path>,
    token: Option<&str>,
) -> crate::Result<PathBuf> {
    let model_dir = cache_dir.as_ref().join(model_id.replace('/', "--"));
    std::fs::create_dir_all(&model_dir)?;

    tracing::info!("Fetching {} into {:?}", model_id, model_dir);

    let client = reqwest::Client::new();
    let base_url = format!("{}/{}/resolve/main", HF_BASE, model_id);

    for file in REQUIRED_FILES {
        download_file(&client, &base_url, file, &model_dir, token).await?;
    }

    let weights = list_safetensors(&client, model_id, token).await?;

    let pb = ProgressBar::new(weights.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    for filename in &weights {
        pb.set_message(filename.clone());
        download_file(&client, &base_url, filename, &model_dir, token).await?;
        pb.inc(1);
    }
    pb.finish_with_message("Download complete");

    Ok(model_dir)
}

/// Check that a local model directory has what calibration reads
pub async fn ensure_model_files(model_path: impl AsRef<Path>) -> crate::Result<()> {
    let path = model_path.as_ref();

    if !path.is_dir() {
        return Err(KvCalibError::ModelNotFound(path.display().to_string()));
    }

    for file in REQUIRED_FILES {
        if !tokio::fs::try_exists(path.join(file)).await? {
            return Err(KvCalibError::ModelNotFound(format!(
                "{} not found in {}",
                file,
                path.display()
            )));
        }
    }

    Ok(())
}

/// Directory downloaded models are cached in
pub fn model_cache_dir() -> crate::Result<PathBuf> {
    if let Ok(cache) = std::env::var("KVCALIB_CACHE") {
        return Ok(PathBuf::from(cache));
    }

    if let Ok(cache) = std::env::var("HF_HOME") {
        return Ok(PathBuf::from(cache).join("hub"));
    }

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| {
            KvCalibError::ConfigError("Could not determine home directory".to_string())
        })?;

    Ok(PathBuf::from(home).join(".cache").join("kvcalib"))
}

fn authorized(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.header("Authorization", format!("Bearer {}", token)),
        None => request,
    }
}

async fn list_safetensors(
    client: &reqwest::Client,
    model_id: &str,
    token: Option<&str>,
) -> crate::Result<Vec<String>> {
    let api_url = format!("{}/api/models/{}", HF_BASE, model_id);

    let response = authorized(client.get(&api_url), token)
        .send()
        .await
        .map_err(|e| KvCalibError::DownloadError(format!("Failed to fetch model info: {}", e)))?;

    if !response.status().is_success() {
        return Err(KvCalibError::DownloadError(format!(
            "Failed to fetch model info: HTTP {}",
            response.status()
        )));
    }

    let model_info: serde_json::Value = response
        .json()
        .await
        .map_err(|e| KvCalibError::DownloadError(format!("Failed to parse model info: {}", e)))?;

    let siblings = model_info["siblings"]
        .as_array()
        .ok_or_else(|| KvCalibError::DownloadError("No files found in model".to_string()))?;

    let weights: Vec<String> = siblings
        .iter()
        .filter_map(|s| s["rfilename"].as_str())
        .filter(|name| name.ends_with(".safetensors"))
        .map(str::to_string)
        .collect();

    if weights.is_empty() {
        return Err(KvCalibError::DownloadError(format!(
            "{} has no safetensors weights",
            model_id
        )));
    }

    Ok(weights)
}

async fn download_file(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    dest_dir: &Path,
    token: Option<&str>,
) -> crate::Result<()> {
    let dest_path = dest_dir.join(filename);

    if dest_path.exists() {
        tracing::debug!("File {} already exists, skipping", filename);
        return Ok(());
    }

    let url = format!("{}/{}", base_url, filename);
    let response = authorized(client.get(&url), token)
        .send()
        .await
        .map_err(|e| {
            KvCalibError::DownloadError(format!("Failed to download {}: {}", filename, e))
        })?;

    if !response.status().is_success() {
        return Err(KvCalibError::DownloadError(format!(
            "Failed to download {}: HTTP {}",
            filename,
            response.status()
        )));
    }

    let bytes = response.bytes().await.map_err(|e| {
        KvCalibError::DownloadError(format!("Failed to read {}: {}", filename, e))
    })?;

    // write under a temporary name so an interrupted run is not taken as cached
    let partial = dest_dir.join(format!("{}.partial", filename));
    tokio::fs::write(&partial, &bytes).await?;
    tokio::fs::rename(&partial, &dest_path).await?;

    tracing::info!("Downloaded {} ({} bytes)", filename, bytes.len());
    Ok(())
}
