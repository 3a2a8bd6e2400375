//! kvcalib CLI - int8 KV cache calibration
//!
//! Runs a calibration corpus through a model and writes the per-layer,
//! per-shard key/value quantization parameters a serving engine loads.

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand};

use rs_kvcalib::{
    calibration::{self, KvParamsManifest, LayerShard, MANIFEST_FILE},
    config::ModelConfig,
    CalibConfig, KvQuantParams, QuantScheme,
};

#[derive(Parser)]
#[command(name = "kvcalib")]
#[command(author, version, about = "KV cache int8 calibration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Calibrate a model and export its KV cache quantization parameters
    Calibrate {
        /// Model path or HuggingFace model ID
        #[arg(short, long)]
        model: Option<String>,

        /// JSON run configuration; flags given on the command line override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Quantization bit width [default: 8]
        #[arg(long)]
        bits: Option<u8>,

        /// Statistic granularity [default: per_tensor]
        #[arg(long)]
        granularity: Option<String>,

        /// Symmetric (true) or asymmetric (false) quantization [default: true]
        #[arg(long, action = ArgAction::Set)]
        symmetry: Option<bool>,

        /// Keep decoder layers in host memory between forward calls
        #[arg(long)]
        offload: bool,

        /// Tokens per calibration sample [default: 2048]
        #[arg(long)]
        max_seq_len: Option<usize>,

        /// Tensor-parallel shards [default: 1]
        #[arg(long)]
        num_tp: Option<usize>,

        /// c4, ptb, wikitext2 or pileval [default: c4]
        #[arg(long)]
        calib_dataset: Option<String>,

        /// Number of calibration samples [default: 128]
        #[arg(long)]
        calib_samples: Option<usize>,

        /// Output directory [default: ./kv_scales]
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Corpus file [default: ./calib_data/<dataset>.txt|jsonl]
        #[arg(long)]
        data_path: Option<PathBuf>,

        /// Seed for sample selection [default: 0]
        #[arg(long)]
        seed: Option<u64>,

        /// GPU device ID (auto-detect if not specified)
        #[arg(long)]
        device: Option<usize>,

        /// HuggingFace token for gated models
        #[arg(long, env = "HF_TOKEN")]
        hf_token: Option<String>,
    },

    /// Print the parameters stored in an artifact file or directory
    Inspect {
        /// A `.weight` file or an output directory
        path: PathBuf,

        /// Parse as symmetric [k_scale, v_scale]
        #[arg(long, conflicts_with = "asymmetric")]
        symmetric: bool,

        /// Parse as asymmetric [k_scale, k_zp, v_scale, v_zp]
        #[arg(long)]
        asymmetric: bool,
    },

    /// Show KV cache geometry of a model
    Info {
        /// Model path
        #[arg(short, long)]
        model: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rs_kvcalib=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Calibrate {
            model,
            config,
            bits,
            granularity,
            symmetry,
            offload,
            max_seq_len,
            num_tp,
            calib_dataset,
            calib_samples,
            output_dir,
            data_path,
            seed,
            device,
            hf_token,
        } => {
            let mut run_config = match (config, model) {
                (Some(path), model) => {
                    let mut file_config = CalibConfig::from_file(path)?;
                    if let Some(model) = model {
                        file_config.model = model;
                    }
                    file_config
                }
                (None, Some(model)) => CalibConfig::new(model),
                (None, None) => anyhow::bail!("either --model or --config is required"),
            };

            if let Some(bits) = bits {
                run_config.bits = bits;
            }
            if let Some(granularity) = granularity {
                run_config.granularity = granularity.parse()?;
            }
            if let Some(symmetry) = symmetry {
                run_config.scheme = QuantScheme::from_symmetry(symmetry);
            }
            run_config.offload |= offload;
            if let Some(max_seq_len) = max_seq_len {
                run_config.max_seq_len = max_seq_len;
            }
            if let Some(num_tp) = num_tp {
                run_config.num_tp = num_tp;
            }
            if let Some(calib_dataset) = calib_dataset {
                run_config.calib_dataset = calib_dataset.parse()?;
            }
            if let Some(calib_samples) = calib_samples {
                run_config.calib_samples = calib_samples;
            }
            if let Some(output_dir) = output_dir {
                run_config.output_dir = output_dir;
            }
            if data_path.is_some() {
                run_config.data_path = data_path;
            }
            if let Some(seed) = seed {
                run_config.seed = seed;
            }

            calibrate(&run_config, hf_token.as_deref(), device).await?;
        }

        Commands::Inspect {
            path,
            symmetric,
            asymmetric,
        } => {
            let scheme = match (symmetric, asymmetric) {
                (true, _) => Some(QuantScheme::Symmetric),
                (_, true) => Some(QuantScheme::Asymmetric),
                _ => None,
            };
            inspect(&path, scheme)?;
        }

        Commands::Info { model } => {
            show_info(&model)?;
        }
    }

    Ok(())
}

async fn calibrate(
    config: &CalibConfig,
    hf_token: Option<&str>,
    device: Option<usize>,
) -> anyhow::Result<()> {
    println!("Calibrating: {}", config.model);
    println!("Scheme: {}, bits: {}, num_tp: {}", config.scheme, config.bits, config.num_tp);
    println!(
        "Dataset: {} ({} samples x {} tokens)",
        config.calib_dataset, config.calib_samples, config.max_seq_len
    );

    let summary = calibration::run(config, hf_token, device).await?;

    println!("\nWrote {} files to {:?}", summary.files.len(), config.output_dir);
    if !summary.degenerate.is_empty() {
        println!(
            "{} (layer, shard) pairs had a zero-width range and use the minimal scale:",
            summary.degenerate.len()
        );
        for coords in &summary.degenerate {
            println!("  layer {} shard {}", coords.layer, coords.shard);
        }
    }

    Ok(())
}

fn inspect(path: &Path, scheme: Option<QuantScheme>) -> anyhow::Result<()> {
    let entries = if path.is_dir() {
        if let Ok(manifest) = KvParamsManifest::read(path) {
            println!(
                "Manifest: {} {}-bit {}, {} layers x {} shards",
                manifest.scheme,
                manifest.bits,
                manifest.granularity,
                manifest.num_layers,
                manifest.num_tp
            );
        }
        calibration::read_kv_qparams_dir(path, scheme)?
    } else {
        let scheme = match scheme {
            Some(scheme) => scheme,
            None => {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                if !dir.join(MANIFEST_FILE).exists() {
                    anyhow::bail!(
                        "no {} next to {:?}; pass --symmetric or --asymmetric",
                        MANIFEST_FILE,
                        path
                    );
                }
                KvParamsManifest::read(dir)?.scheme
            }
        };

        let coords = LayerShard::from_path(path)?;
        vec![(coords, calibration::read_kv_qparams(path, scheme)?)]
    };

    for (coords, params) in entries {
        match params {
            KvQuantParams::Symmetric { k_scale, v_scale } => println!(
                "layer {:>3} shard {:>2}  k_scale {:.6e}  v_scale {:.6e}",
                coords.layer, coords.shard, k_scale, v_scale
            ),
            KvQuantParams::Asymmetric {
                k_scale,
                k_zero_point,
                v_scale,
                v_zero_point,
            } => println!(
                "layer {:>3} shard {:>2}  k_scale {:.6e}  k_zp {:.6}  v_scale {:.6e}  v_zp {:.6}",
                coords.layer, coords.shard, k_scale, k_zero_point, v_scale, v_zero_point
            ),
        }
    }

    Ok(())
}

fn show_info(model_path: &str) -> anyhow::Result<()> {
    let config = ModelConfig::from_file(Path::new(model_path).join("config.json"))?;

    println!("Model Information");
    println!("=================");
    println!("Architecture: {:?}", config.architecture());
    println!("Num layers: {}", config.num_hidden_layers);
    println!("Num attention heads: {}", config.num_attention_heads);
    println!("Num KV heads: {}", config.num_kv_heads());
    println!("Head dim: {}", config.head_dim());
    println!("Max position embeddings: {}", config.max_position_embeddings);
    println!("Using GQA: {}", config.is_gqa());
    println!("Valid num_tp: {:?}", config.valid_num_tp());

    let tokens = config.max_position_embeddings;
    let fp16 = config.kv_cache_bytes_per_token(2);
    let int8 = config.kv_cache_bytes_per_token(1);

    println!("\nKV Cache Memory");
    println!("===============");
    println!("Per token (FP16): {} bytes", fp16);
    println!("Per token (INT8): {} bytes", int8);
    println!(
        "At {} tokens: ~{:.2} GB (FP16), ~{:.2} GB (INT8)",
        tokens,
        (fp16 * tokens) as f64 / 1e9,
        (int8 * tokens) as f64 / 1e9
    );

    Ok(())
}
