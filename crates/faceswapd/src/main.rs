use anyhow::{Context, Result};
use faceswapd::models::ModelSet;
use faceswapd::Config;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Serverless worker: one JSON event per stdin line, one JSON result per
/// stdout line. Logs go to stderr.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "faceswapd starting");

    let config = Config::from_env();
    let models = Arc::new(ModelSet::from_config(&config).context("failed to configure models")?);
    let service = Arc::new(faceswapd::build_service(&config, models));

    // A worker that cannot load its models must not accept jobs.
    if let Err(e) = service.warm_up().await {
        tracing::error!(error = %e, "model warm-up failed");
        anyhow::bail!("model warm-up failed: {e}");
    }
    faceswapd::memory::log_stage("ready");
    tracing::info!("faceswapd ready");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let service = service.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let output = service.dispatch_line(&line).await;
                    let _ = out_tx.send(format!("{output}\n"));
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    tracing::info!("faceswapd shutting down");
    Ok(())
}
