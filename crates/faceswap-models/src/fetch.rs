//! Artifact sources.
//!
//! A source materializes an artifact's bytes at a caller-chosen staging path.
//! It never touches the active path; promotion is the recovery controller's job.

use crate::artifact::ModelArtifact;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },
    #[error("{0}")]
    Unavailable(String),
}

/// Somewhere an artifact can be re-materialized from.
pub trait ArtifactSource: Send + Sync {
    /// Write the artifact to `dest`, returning the number of bytes written.
    fn fetch(&self, artifact: &ModelArtifact, dest: &Path) -> Result<u64, FetchError>;

    /// Short human-readable label for logs.
    fn describe(&self) -> String;
}

/// Downloads from the artifact's manifest URLs, in order.
///
/// The blocking client is built on first use so that constructing the source
/// inside an async runtime is harmless; fetches must run off the runtime.
pub struct HttpSource {
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, FetchError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("faceswap/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let http_err = |e: reqwest::Error| FetchError::Http {
            url: url.to_string(),
            message: e.to_string(),
        };

        let mut response = self.client()?.get(url).send().map_err(http_err)?;
        if !response.status().is_success() {
            return Err(FetchError::Http {
                url: url.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }

        let file = File::create(dest).map_err(|source| io_err(dest, source))?;
        let mut writer = BufWriter::new(file);
        let written = response.copy_to(&mut writer).map_err(http_err)?;
        writer.flush().map_err(|source| io_err(dest, source))?;
        Ok(written)
    }
}

impl ArtifactSource for HttpSource {
    fn fetch(&self, artifact: &ModelArtifact, dest: &Path) -> Result<u64, FetchError> {
        if artifact.urls.is_empty() {
            return Err(FetchError::Unavailable(format!("{} has no download URLs", artifact.id)));
        }

        let mut last = None;
        for url in &artifact.urls {
            tracing::info!(artifact = %artifact.id, url, "downloading model");
            match self.download(url, dest) {
                Ok(bytes) => {
                    tracing::info!(artifact = %artifact.id, url, bytes, "download complete");
                    return Ok(bytes);
                }
                Err(e) => {
                    tracing::warn!(artifact = %artifact.id, url, error = %e, "download failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| FetchError::Unavailable("no URL attempted".into())))
    }

    fn describe(&self) -> String {
        "http".into()
    }
}

/// Copies from a directory of known-good files shipped alongside the service.
pub struct BundledSource {
    dir: PathBuf,
}

impl BundledSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactSource for BundledSource {
    fn fetch(&self, artifact: &ModelArtifact, dest: &Path) -> Result<u64, FetchError> {
        let src = self.dir.join(artifact.file_name());
        if !src.is_file() {
            return Err(FetchError::Unavailable(format!(
                "no bundled copy of {} at {}",
                artifact.id,
                src.display()
            )));
        }
        tracing::info!(artifact = %artifact.id, src = %src.display(), "copying bundled model");
        std::fs::copy(&src, dest).map_err(|source| io_err(dest, source))
    }

    fn describe(&self) -> String {
        format!("bundled:{}", self.dir.display())
    }
}

/// Tries each source in order; the first success wins.
pub struct SourceChain {
    sources: Vec<Box<dyn ArtifactSource>>,
}

impl SourceChain {
    pub fn new(sources: Vec<Box<dyn ArtifactSource>>) -> Self {
        Self { sources }
    }
}

impl ArtifactSource for SourceChain {
    fn fetch(&self, artifact: &ModelArtifact, dest: &Path) -> Result<u64, FetchError> {
        let mut failures = Vec::new();
        for source in &self.sources {
            match source.fetch(artifact, dest) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => failures.push(format!("{}: {e}", source.describe())),
            }
        }
        if failures.is_empty() {
            failures.push("no sources configured".into());
        }
        Err(FetchError::Unavailable(failures.join("; ")))
    }

    fn describe(&self) -> String {
        let names: Vec<String> = self.sources.iter().map(|s| s.describe()).collect();
        format!("chain[{}]", names.join(","))
    }
}

fn io_err(path: &Path, source: io::Error) -> FetchError {
    FetchError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactId, Validity, Variant};
    use crate::testutil::FakeSource;

    fn artifact(dir: &Path) -> ModelArtifact {
        ModelArtifact {
            id: ArtifactId { model: "detector".into(), variant: Variant::Fp32 },
            path: dir.join("det_10g.onnx"),
            min_bytes: 1,
            sha256: None,
            urls: vec![],
            validity: Validity::Unknown,
        }
    }

    #[test]
    fn test_bundled_source_copies_file() {
        let bundle = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        std::fs::write(bundle.path().join("det_10g.onnx"), b"model-bytes").unwrap();

        let a = artifact(models.path());
        let dest = a.partial_path();
        let n = BundledSource::new(bundle.path()).fetch(&a, &dest).unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(dest).unwrap(), b"model-bytes");
        assert!(!a.path.exists());
    }

    #[test]
    fn test_bundled_source_missing_file() {
        let bundle = tempfile::tempdir().unwrap();
        let models = tempfile::tempdir().unwrap();
        let a = artifact(models.path());
        let err = BundledSource::new(bundle.path()).fetch(&a, &a.partial_path()).unwrap_err();
        assert!(matches!(err, FetchError::Unavailable(_)));
    }

    #[test]
    fn test_http_source_without_urls_is_unavailable() {
        let models = tempfile::tempdir().unwrap();
        let a = artifact(models.path());
        let source = HttpSource::new(Duration::from_secs(1));
        let err = source.fetch(&a, &a.partial_path()).unwrap_err();
        assert!(err.to_string().contains("detector/fp32"));
    }

    #[test]
    fn test_chain_falls_through_to_next_source() {
        let models = tempfile::tempdir().unwrap();
        let a = artifact(models.path());
        let chain = SourceChain::new(vec![
            Box::new(FakeSource::always_failing()),
            Box::new(FakeSource::succeeding(256)),
        ]);
        assert_eq!(chain.fetch(&a, &a.partial_path()).unwrap(), 256);
        assert_eq!(chain.describe(), "chain[fake,fake]");
    }

    #[test]
    fn test_chain_collects_every_failure() {
        let models = tempfile::tempdir().unwrap();
        let a = artifact(models.path());
        let chain = SourceChain::new(vec![
            Box::new(FakeSource::always_failing()),
            Box::new(FakeSource::always_failing()),
        ]);
        let msg = chain.fetch(&a, &a.partial_path()).unwrap_err().to_string();
        assert_eq!(msg.matches("fake failure").count(), 2);
    }
}
