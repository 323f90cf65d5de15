use faceswap_models::{Manifest, ManifestError, RetryPolicy, Variant};
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the active model artifacts.
    pub model_dir: PathBuf,
    /// Manifest override; the embedded manifest is used when unset.
    pub manifest_path: Option<PathBuf>,
    /// Directory of known-good artifact copies tried before the network.
    pub bundled_dir: Option<PathBuf>,
    /// Derived-cache directories purged when an artifact is recovered.
    pub cache_dirs: Vec<PathBuf>,
    /// Swap-model variant preference order.
    pub swapper_variants: Vec<Variant>,
    /// Caller-visible deadline for one swap request.
    pub request_timeout_secs: u64,
    /// Timeout for fetching one input image.
    pub image_timeout_secs: u64,
    /// Timeout for downloading one model artifact.
    pub model_fetch_timeout_secs: u64,
    /// Largest accepted input image, in bytes.
    pub max_image_bytes: u64,
    /// Longest side an input is downscaled to; 0 disables downscaling.
    pub max_dimension: u32,
    pub recovery_attempts: u32,
    pub recovery_backoff_ms: u64,
    /// Requests allowed to wait behind the one in flight.
    pub queue_depth: usize,
}

impl Config {
    /// Load configuration from `FACESWAP_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());

        let model_dir = std::env::var("FACESWAP_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(&home).join(".local/share"))
                    .join("faceswap/models")
            });

        let cache_dirs = match std::env::var("FACESWAP_CACHE_DIRS") {
            Ok(v) => v
                .split(':')
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
            Err(_) => vec![PathBuf::from(&home).join(".insightface/models")],
        };

        Self {
            model_dir,
            manifest_path: env_path("FACESWAP_MANIFEST"),
            bundled_dir: env_path("FACESWAP_BUNDLED_DIR"),
            cache_dirs,
            swapper_variants: parse_variants(
                &std::env::var("FACESWAP_SWAPPER_VARIANTS").unwrap_or_else(|_| "fp16,fp32".to_string()),
            ),
            request_timeout_secs: env_u64("FACESWAP_REQUEST_TIMEOUT_SECS", 60),
            image_timeout_secs: env_u64("FACESWAP_IMAGE_TIMEOUT_SECS", 30),
            model_fetch_timeout_secs: env_u64("FACESWAP_MODEL_FETCH_TIMEOUT_SECS", 600),
            max_image_bytes: env_u64("FACESWAP_MAX_IMAGE_BYTES", 10 * 1024 * 1024),
            max_dimension: env_u64("FACESWAP_MAX_DIMENSION", 1024) as u32,
            recovery_attempts: env_u64("FACESWAP_RECOVERY_ATTEMPTS", 3).max(1) as u32,
            recovery_backoff_ms: env_u64("FACESWAP_RECOVERY_BACKOFF_MS", 500),
            queue_depth: env_usize("FACESWAP_QUEUE_DEPTH", 1).max(1),
        }
    }

    /// The configured manifest, or the embedded one.
    pub fn manifest(&self) -> Result<Manifest, ManifestError> {
        match &self.manifest_path {
            Some(path) => Manifest::load(path),
            None => Ok(Manifest::embedded().clone()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.recovery_attempts,
            base_backoff: Duration::from_millis(self.recovery_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Parse a comma-separated variant list, skipping unknown names.
fn parse_variants(list: &str) -> Vec<Variant> {
    let mut out = Vec::new();
    for item in list.split(',').filter(|s| !s.trim().is_empty()) {
        match item.parse::<Variant>() {
            Ok(v) if !out.contains(&v) => out.push(v),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "ignoring FACESWAP_SWAPPER_VARIANTS entry"),
        }
    }
    out
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants() {
        assert_eq!(parse_variants("fp16,fp32"), vec![Variant::Fp16, Variant::Fp32]);
        assert_eq!(parse_variants(" fp32 , half,fp32"), vec![Variant::Fp32, Variant::Fp16]);
        assert_eq!(parse_variants("int8,fp32"), vec![Variant::Fp32]);
        assert!(parse_variants("").is_empty());
    }

    #[test]
    fn test_embedded_manifest_when_unset() {
        let config = Config {
            manifest_path: None,
            ..Config::from_env()
        };
        assert!(config.manifest().unwrap().model("swapper").is_some());
    }
}
