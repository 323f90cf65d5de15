use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use faceswap_models::{Integrity, IntegrityChecker};
use faceswapd::models::ModelSet;
use faceswapd::{Config, Service, SwapRequest};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceswap", about = "faceswap inference and model maintenance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Swap a face from the source image onto the target image
    Swap {
        /// Source image URL or local path
        #[arg(short, long)]
        source: String,
        /// Target image URL or local path
        #[arg(short, long)]
        target: String,
        /// 1-based index of the source face, counted left to right
        #[arg(long, default_value_t = 1)]
        source_index: usize,
        /// 1-based index of the target face, counted left to right
        #[arg(long, default_value_t = 1)]
        target_index: usize,
        /// Where to write the resulting PNG
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Re-download and revalidate every model artifact
    FixModel,
    /// Show model readiness and memory usage
    Health {
        /// Load every model first
        #[arg(long)]
        load: bool,
    },
    /// Check one model file's integrity without loading it
    Validate {
        file: PathBuf,
        /// Known-good minimum size in bytes
        #[arg(long, default_value_t = 0)]
        min_bytes: u64,
        /// Expected SHA-256 digest (hex)
        #[arg(long)]
        sha256: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Swap {
            source,
            target,
            source_index,
            target_index,
            output,
        } => {
            let service = service()?;
            let request = SwapRequest {
                source_url: to_url(&source)?,
                target_url: to_url(&target)?,
                source_index,
                target_index,
            };
            let result = service.swap(request).await;
            let Some(encoded) = result.image_base64 else {
                eprintln!("swap failed: {}", result.message.unwrap_or_default());
                return Ok(ExitCode::FAILURE);
            };
            let png = STANDARD.decode(encoded).context("service returned invalid base64")?;
            std::fs::write(&output, &png).with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Wrote {} ({}x{}, {} bytes)",
                output.display(),
                result.width.unwrap_or_default(),
                result.height.unwrap_or_default(),
                png.len()
            );
        }
        Commands::FixModel => {
            let report = service()?.fix_model().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_valid {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Health { load } => {
            let service = service()?;
            if load {
                if let Err(e) = service.warm_up().await {
                    tracing::warn!(error = %e, "warm-up failed");
                }
            }
            let health = service.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if health.status != "healthy" {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Validate {
            file,
            min_bytes,
            sha256,
        } => {
            let result = IntegrityChecker.check_file(&file, min_bytes, sha256.as_deref());
            match &result {
                Integrity::Valid { bytes } => println!("{}: valid ({bytes} bytes)", file.display()),
                Integrity::Corrupt(reason) => println!("{}: corrupt: {reason}", file.display()),
                Integrity::Missing => println!("{}: missing", file.display()),
            }
            if !result.is_valid() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn service() -> Result<Service> {
    let config = Config::from_env();
    tracing::info!(model_dir = %config.model_dir.display(), "using model directory");
    let models = Arc::new(ModelSet::from_config(&config).context("failed to configure models")?);
    Ok(faceswapd::build_service(&config, models))
}

/// Pass URLs through; turn local paths into absolute `file://` URLs.
fn to_url(input: &str) -> Result<String> {
    if input.contains("://") {
        return Ok(input.to_string());
    }
    let path = Path::new(input);
    if !path.exists() {
        bail!("no such file: {input}");
    }
    let abs = std::fs::canonicalize(path).with_context(|| format!("failed to resolve {input}"))?;
    Ok(format!("file://{}", abs.display()))
}
