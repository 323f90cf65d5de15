//! The service's model set: detector, recognizer and swapper stores wired to
//! one recovery controller.

use crate::backend::Invalidate;
use crate::config::Config;
use faceswap_core::detector::{DetectorError, FaceDetector};
use faceswap_core::recognizer::{FaceRecognizer, RecognizerError};
use faceswap_core::swapper::{FaceSwapper, SwapperError};
use faceswap_models::onnx::{self, OnnxError};
use faceswap_models::{
    ArtifactSource, BundledSource, HttpSource, Maintained, ManifestError, ModelArtifact, ModelHandle,
    ModelLoader, ModelReadiness, ModelStore, RecoveryController, RecoveryReport, SourceChain, StoreError,
    Variant,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const DETECTOR: &str = "detector";
pub const RECOGNIZER: &str = "recognizer";
pub const SWAPPER: &str = "swapper";

const EMAP_DIM: u64 = 512;

#[derive(Error, Debug)]
pub enum ModelSetError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("manifest does not declare model {0:?}")]
    MissingModel(&'static str),
    #[error("failed to create model directory {path}: {source}")]
    ModelDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct DetectorLoader;

impl ModelLoader for DetectorLoader {
    type Handle = Mutex<FaceDetector>;
    type Error = DetectorError;

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Handle, DetectorError> {
        FaceDetector::load(&artifact.path).map(Mutex::new)
    }
}

pub struct RecognizerLoader;

impl ModelLoader for RecognizerLoader {
    type Handle = Mutex<FaceRecognizer>;
    type Error = RecognizerError;

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Handle, RecognizerError> {
        FaceRecognizer::load(&artifact.path).map(Mutex::new)
    }
}

#[derive(Error, Debug)]
pub enum SwapperLoadError {
    #[error("failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Onnx(#[from] OnnxError),
    #[error("model graph has no 512x512 embedding map initializer")]
    NoEmbeddingMap,
    #[error(transparent)]
    Swapper(#[from] SwapperError),
}

pub struct SwapperLoader;

impl ModelLoader for SwapperLoader {
    type Handle = Mutex<FaceSwapper>;
    type Error = SwapperLoadError;

    fn load(&self, artifact: &ModelArtifact) -> Result<Self::Handle, SwapperLoadError> {
        let emap = {
            let bytes = std::fs::read(&artifact.path)?;
            onnx::find_float_initializer(&bytes, EMAP_DIM, EMAP_DIM)?.ok_or(SwapperLoadError::NoEmbeddingMap)?
        };
        Ok(Mutex::new(FaceSwapper::load(&artifact.path, emap)?))
    }
}

/// All models the pipeline needs. The loaders default to the ONNX Runtime ones.
pub struct ModelSet<D = DetectorLoader, R = RecognizerLoader, S = SwapperLoader>
where
    D: ModelLoader,
    R: ModelLoader,
    S: ModelLoader,
{
    detector: ModelStore<D>,
    recognizer: ModelStore<R>,
    swapper: ModelStore<S>,
    swapper_variants: Vec<Variant>,
}

impl ModelSet {
    pub fn from_config(config: &Config) -> Result<Self, ModelSetError> {
        let manifest = config.manifest()?;
        std::fs::create_dir_all(&config.model_dir).map_err(|source| ModelSetError::ModelDir {
            path: config.model_dir.display().to_string(),
            source,
        })?;

        let mut sources: Vec<Box<dyn ArtifactSource>> = Vec::new();
        if let Some(dir) = &config.bundled_dir {
            sources.push(Box::new(BundledSource::new(dir)));
        }
        sources.push(Box::new(HttpSource::new(Duration::from_secs(config.model_fetch_timeout_secs))));

        let recovery = Arc::new(
            RecoveryController::new(Arc::new(SourceChain::new(sources)), config.retry_policy())
                .with_cache_dirs(config.cache_dirs.clone()),
        );

        let spec = |name: &'static str| manifest.model(name).ok_or(ModelSetError::MissingModel(name));
        let dir = &config.model_dir;

        tracing::info!(
            model_dir = %dir.display(),
            swapper_variants = ?config.swapper_variants,
            "model set configured"
        );

        Ok(Self::new(
            ModelStore::new(DetectorLoader, recovery.clone()).with_model(spec(DETECTOR)?, dir, &[]),
            ModelStore::new(RecognizerLoader, recovery.clone()).with_model(spec(RECOGNIZER)?, dir, &[]),
            ModelStore::new(SwapperLoader, recovery).with_model(spec(SWAPPER)?, dir, &config.swapper_variants),
            config.swapper_variants.clone(),
        ))
    }
}

impl<D: ModelLoader, R: ModelLoader, S: ModelLoader> ModelSet<D, R, S> {
    pub fn new(
        detector: ModelStore<D>,
        recognizer: ModelStore<R>,
        swapper: ModelStore<S>,
        swapper_variants: Vec<Variant>,
    ) -> Self {
        Self {
            detector,
            recognizer,
            swapper,
            swapper_variants,
        }
    }

    pub fn detector(&self) -> Result<ModelHandle<D::Handle>, StoreError> {
        self.detector.acquire(DETECTOR, &[])
    }

    pub fn recognizer(&self) -> Result<ModelHandle<R::Handle>, StoreError> {
        self.recognizer.acquire(RECOGNIZER, &[])
    }

    pub fn swapper(&self) -> Result<ModelHandle<S::Handle>, StoreError> {
        self.swapper.acquire(SWAPPER, &self.swapper_variants)
    }

    fn stores(&self) -> [&dyn Maintained; 3] {
        [&self.detector, &self.recognizer, &self.swapper]
    }
}

impl<D: ModelLoader, R: ModelLoader, S: ModelLoader> Invalidate for ModelSet<D, R, S> {
    fn invalidate(&self, model: &str) {
        match model {
            DETECTOR => self.detector.invalidate(model),
            RECOGNIZER => self.recognizer.invalidate(model),
            SWAPPER => self.swapper.invalidate(model),
            _ => tracing::debug!(model, "ignoring invalidation of unknown model"),
        }
    }
}

impl<D: ModelLoader, R: ModelLoader, S: ModelLoader> Maintained for ModelSet<D, R, S> {
    fn warm_up(&self) -> Result<(), StoreError> {
        self.detector()?;
        self.recognizer()?;
        self.swapper()?;
        Ok(())
    }

    fn fix_all(&self) -> Vec<RecoveryReport> {
        self.stores().iter().flat_map(|s| s.fix_all()).collect()
    }

    fn readiness(&self) -> Vec<ModelReadiness> {
        self.stores().iter().flat_map(|s| s.readiness()).collect()
    }

    fn invalidate_all(&self) {
        for store in self.stores() {
            store.invalidate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceswap_models::{Manifest, RetryPolicy};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ir_version 8 followed by an empty graph.
    const TINY_MODEL: &[u8] = &[0x08, 0x08, 0x3a, 0x00];

    const MANIFEST: &str = r#"
        [[model]]
        name = "detector"
        [[model.variant]]
        variant = "fp32"
        file = "det_10g.onnx"
        min_bytes = 1

        [[model]]
        name = "recognizer"
        [[model.variant]]
        variant = "fp32"
        file = "w600k_r50.onnx"
        min_bytes = 1

        [[model]]
        name = "swapper"
        [[model.variant]]
        variant = "fp32"
        file = "inswapper_128.onnx"
        min_bytes = 1
    "#;

    const FILES: [&str; 3] = ["det_10g.onnx", "w600k_r50.onnx", "inswapper_128.onnx"];

    /// Hands out the load count as the model.
    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl ModelLoader for CountingLoader {
        type Handle = usize;
        type Error = String;

        fn load(&self, _artifact: &ModelArtifact) -> Result<usize, String> {
            Ok(self.loads.fetch_add(1, Ordering::SeqCst))
        }
    }

    type CountingSet = ModelSet<CountingLoader, CountingLoader, CountingLoader>;

    /// Models live in `dir`; recovery copies from `bundled`.
    fn model_set(dir: &Path, bundled: &Path) -> CountingSet {
        for file in FILES {
            std::fs::write(dir.join(file), TINY_MODEL).unwrap();
        }
        let manifest = Manifest::from_toml_str(MANIFEST).unwrap();
        let recovery = Arc::new(RecoveryController::new(
            Arc::new(BundledSource::new(bundled)),
            RetryPolicy { max_attempts: 1, base_backoff: Duration::ZERO },
        ));
        let store = |name: &str| {
            ModelStore::new(CountingLoader::default(), recovery.clone()).with_model(manifest.model(name).unwrap(), dir, &[])
        };
        ModelSet::new(store(DETECTOR), store(RECOGNIZER), store(SWAPPER), Vec::new())
    }

    #[test]
    fn test_invalidate_drops_only_the_named_model() {
        let (dir, bundled) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let set = model_set(dir.path(), bundled.path());
        let detector = set.detector().unwrap();
        let recognizer = set.recognizer().unwrap();
        let swapper = set.swapper().unwrap();

        set.invalidate(SWAPPER);

        assert!(Arc::ptr_eq(&detector, &set.detector().unwrap()));
        assert!(Arc::ptr_eq(&recognizer, &set.recognizer().unwrap()));
        let reloaded = set.swapper().unwrap();
        assert!(!Arc::ptr_eq(&swapper, &reloaded));
        assert_eq!(reloaded.model, 1);
    }

    #[test]
    fn test_unknown_model_name_is_ignored() {
        let (dir, bundled) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let set = model_set(dir.path(), bundled.path());
        let handles = [set.detector().unwrap(), set.recognizer().unwrap(), set.swapper().unwrap()];

        set.invalidate("embedder");

        let again = [set.detector().unwrap(), set.recognizer().unwrap(), set.swapper().unwrap()];
        assert!(handles.iter().zip(&again).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert!(set.readiness().iter().all(|r| r.ready));
    }

    #[test]
    fn test_invalidated_model_revalidates_its_artifact() {
        let (dir, bundled) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        std::fs::write(bundled.path().join("inswapper_128.onnx"), TINY_MODEL).unwrap();
        let set = model_set(dir.path(), bundled.path());
        let before = set.swapper().unwrap();

        let active = dir.path().join("inswapper_128.onnx");
        std::fs::write(&active, b"<html>503 Service Unavailable</html>").unwrap();
        // The cached handle is served without touching the disk.
        assert!(Arc::ptr_eq(&before, &set.swapper().unwrap()));

        set.invalidate(SWAPPER);
        let after = set.swapper().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(std::fs::read(&active).unwrap(), TINY_MODEL);
        let archived = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(archived, 1);
    }

    #[test]
    fn test_invalidated_model_unavailable_without_good_copy() {
        let (dir, bundled) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let set = model_set(dir.path(), bundled.path());
        set.recognizer().unwrap();

        std::fs::write(dir.path().join("w600k_r50.onnx"), b"truncated").unwrap();
        set.invalidate(RECOGNIZER);

        assert!(matches!(set.recognizer(), Err(StoreError::ModelUnavailable { .. })));
        assert!(set.detector().is_ok());
    }
}
