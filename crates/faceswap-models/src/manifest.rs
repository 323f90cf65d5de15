//! Model manifest.
//!
//! Declares every logical model, its variants, file names, size floors and
//! download locations. The default manifest is embedded at compile time from
//! `contrib/models/manifest.toml`; operators may point at their own file.

use crate::artifact::{ArtifactId, ModelArtifact, Validity, Variant};
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

const EMBEDDED_MANIFEST: &str = include_str!("../../../contrib/models/manifest.toml");

static EMBEDDED: OnceLock<Manifest> = OnceLock::new();

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad manifest TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("model {model} declares variant {variant} more than once")]
    DuplicateVariant { model: String, variant: Variant },
    #[error("model {0} declares no variants")]
    NoVariants(String),
}

/// Top-level manifest structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "model")]
    pub models: Vec<ModelSpec>,
}

/// One logical model from a `[[model]]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    #[serde(rename = "variant")]
    pub variants: Vec<VariantSpec>,
}

/// One serialization of a model from a `[[model.variant]]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct VariantSpec {
    pub variant: Variant,
    pub file: String,
    pub min_bytes: u64,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

impl Manifest {
    /// The compiled-in manifest.
    pub fn embedded() -> &'static Manifest {
        EMBEDDED.get_or_init(|| match Manifest::from_toml_str(EMBEDDED_MANIFEST) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(error = %e, "embedded model manifest is invalid");
                Manifest { models: Vec::new() }
            }
        })
    }

    pub fn from_toml_str(src: &str) -> Result<Self, ManifestError> {
        let manifest: Manifest = toml::from_str(src)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let src = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&src)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        for model in &self.models {
            if model.variants.is_empty() {
                return Err(ManifestError::NoVariants(model.name.clone()));
            }
            for (i, v) in model.variants.iter().enumerate() {
                if model.variants[..i].iter().any(|o| o.variant == v.variant) {
                    return Err(ManifestError::DuplicateVariant {
                        model: model.name.clone(),
                        variant: v.variant,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == name)
    }
}

impl ModelSpec {
    /// Build the artifacts for this model rooted at `model_dir`, in manifest order.
    pub fn artifacts(&self, model_dir: &Path) -> Vec<ModelArtifact> {
        self.variants
            .iter()
            .map(|v| ModelArtifact {
                id: ArtifactId {
                    model: self.name.clone(),
                    variant: v.variant,
                },
                path: model_dir.join(&v.file),
                min_bytes: v.min_bytes,
                sha256: v.sha256.as_ref().map(|s| s.to_ascii_lowercase()),
                urls: v.urls.clone(),
                validity: Validity::Unknown,
            })
            .collect()
    }

    pub fn variants(&self) -> impl Iterator<Item = Variant> + '_ {
        self.variants.iter().map(|v| v.variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_manifest_declares_all_models() {
        let m = Manifest::embedded();
        assert!(m.model("detector").is_some());
        assert!(m.model("recognizer").is_some());
        let swapper = m.model("swapper").unwrap();
        assert_eq!(swapper.variants().collect::<Vec<_>>(), vec![Variant::Fp16, Variant::Fp32]);
    }

    #[test]
    fn test_artifacts_rooted_at_model_dir() {
        let m = Manifest::embedded();
        let artifacts = m.model("swapper").unwrap().artifacts(Path::new("/srv/models"));
        assert_eq!(artifacts[0].path, Path::new("/srv/models/inswapper_128.fp16.onnx"));
        assert_eq!(artifacts[0].validity, Validity::Unknown);
        assert!(artifacts.iter().all(|a| a.min_bytes > 1_000_000));
    }

    #[test]
    fn test_duplicate_variant_rejected() {
        let src = r#"
            [[model]]
            name = "swapper"
            [[model.variant]]
            variant = "fp32"
            file = "a.onnx"
            min_bytes = 10
            [[model.variant]]
            variant = "fp32"
            file = "b.onnx"
            min_bytes = 10
        "#;
        assert!(matches!(
            Manifest::from_toml_str(src),
            Err(ManifestError::DuplicateVariant { .. })
        ));
    }

    #[test]
    fn test_sha256_is_lowercased() {
        let src = r#"
            [[model]]
            name = "detector"
            [[model.variant]]
            variant = "fp32"
            file = "det.onnx"
            min_bytes = 10
            sha256 = "ABCDEF"
        "#;
        let m = Manifest::from_toml_str(src).unwrap();
        let a = &m.model("detector").unwrap().artifacts(Path::new("/m"))[0];
        assert_eq!(a.sha256.as_deref(), Some("abcdef"));
        assert!(a.urls.is_empty());
    }
}
