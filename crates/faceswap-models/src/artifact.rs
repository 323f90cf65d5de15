//! Model artifact identity and on-disk layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Alternate serialization of the same logical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Reduced precision (half floats).
    Fp16,
    /// Full precision.
    Fp32,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Variant::Fp16 => "fp16",
            Variant::Fp32 => "fp32",
        })
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp16" | "half" => Ok(Variant::Fp16),
            "fp32" | "full" => Ok(Variant::Fp32),
            other => Err(format!("unknown model variant: {other} (expected fp16 or fp32)")),
        }
    }
}

/// Identity of one artifact: logical model name plus variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId {
    pub model: String,
    pub variant: Variant,
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.variant)
    }
}

/// Last known validity of an artifact on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Unknown,
    Valid,
    Corrupt,
    Missing,
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Validity::Unknown => "unknown",
            Validity::Valid => "valid",
            Validity::Corrupt => "corrupt",
            Validity::Missing => "missing",
        })
    }
}

/// An on-disk model file plus its identity and the facts needed to verify
/// and re-materialize it.
///
/// Only the integrity checker and recovery controller change `validity`;
/// inference code receives loaded handles, never artifacts.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub id: ArtifactId,
    /// Active path. Replaced only by rename from [`ModelArtifact::partial_path`].
    pub path: PathBuf,
    /// Known-good minimum size in bytes.
    pub min_bytes: u64,
    /// Optional lowercase hex SHA-256 of the known-good file.
    pub sha256: Option<String>,
    /// Remote locations, tried in order.
    pub urls: Vec<String>,
    pub validity: Validity,
}

impl ModelArtifact {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Download staging path; renamed over `path` once revalidated.
    pub fn partial_path(&self) -> PathBuf {
        sibling(&self.path, ".partial")
    }

    /// Archive path for a corrupt copy, stamped with `timestamp`.
    pub fn archive_path(&self, timestamp: &str) -> PathBuf {
        sibling(&self.path, &format!(".corrupt-{timestamp}"))
    }

    /// The single backup slot for a valid copy displaced by a forced refetch.
    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, ".backup")
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            id: ArtifactId { model: "swapper".into(), variant: Variant::Fp16 },
            path: PathBuf::from("/models/inswapper_128.fp16.onnx"),
            min_bytes: 1,
            sha256: None,
            urls: vec![],
            validity: Validity::Unknown,
        }
    }

    #[test]
    fn test_variant_parse() {
        assert_eq!("fp16".parse::<Variant>().unwrap(), Variant::Fp16);
        assert_eq!(" FP32 ".parse::<Variant>().unwrap(), Variant::Fp32);
        assert!("int8".parse::<Variant>().is_err());
    }

    #[test]
    fn test_artifact_id_display() {
        assert_eq!(artifact().id.to_string(), "swapper/fp16");
    }

    #[test]
    fn test_staging_and_archive_paths_are_siblings() {
        let a = artifact();
        assert_eq!(a.partial_path(), PathBuf::from("/models/inswapper_128.fp16.onnx.partial"));
        assert_eq!(
            a.archive_path("20240101T000000Z"),
            PathBuf::from("/models/inswapper_128.fp16.onnx.corrupt-20240101T000000Z")
        );
        assert_eq!(a.backup_path(), PathBuf::from("/models/inswapper_128.fp16.onnx.backup"));
        assert_eq!(a.file_name(), "inswapper_128.fp16.onnx");
    }
}
