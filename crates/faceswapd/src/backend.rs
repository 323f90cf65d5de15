use crate::models::{ModelSet, DETECTOR, RECOGNIZER, SWAPPER};
use faceswap_core::{Embedding, FaceDescriptor};
use faceswap_models::StoreError;
use image::RgbImage;
use std::sync::{Arc, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Unavailable(#[from] StoreError),
    #[error("{model} failed: {message}")]
    Inference { model: &'static str, message: String },
    #[error("source face {rank} has no identity embedding")]
    NotEmbedded { rank: usize },
}

/// The face operations the pipeline composes.
pub trait FaceBackend: Send {
    /// Make every model ready. Called once per request before any image work.
    fn prepare(&mut self) -> Result<(), StoreError>;

    /// Detected faces in left-to-right order.
    fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceDescriptor>, BackendError>;

    fn embed(&mut self, image: &RgbImage, face: &FaceDescriptor) -> Result<Embedding, BackendError>;

    /// Paste `source`'s identity onto `face`. `source` must carry its
    /// embedding. Returns a new raster; `target` is left untouched.
    fn swap(
        &mut self,
        target: &RgbImage,
        face: &FaceDescriptor,
        source: &FaceDescriptor,
    ) -> Result<RgbImage, BackendError>;
}

/// Drops a model's cached handle so its next acquisition revalidates the artifact.
pub trait Invalidate: Send + Sync {
    /// Unknown names are ignored.
    fn invalidate(&self, model: &str);
}

/// Log a runtime failure, invalidate the failing model, and build the error.
pub fn report_failure(models: &dyn Invalidate, model: &'static str, message: impl ToString) -> BackendError {
    let message = message.to_string();
    tracing::error!(model, error = %message, "inference failed; invalidating model");
    models.invalidate(model);
    BackendError::Inference { model, message }
}

/// ONNX Runtime backend over the store-managed models.
///
/// Handles are re-acquired per call; after the first load that is a cached
/// `Arc` clone. A failing inference invalidates the model so the next
/// acquisition revalidates its artifact.
pub struct OnnxBackend {
    models: Arc<ModelSet>,
}

impl OnnxBackend {
    pub fn new(models: Arc<ModelSet>) -> Self {
        Self { models }
    }

    fn failed(&self, model: &'static str, message: impl ToString) -> BackendError {
        report_failure(self.models.as_ref(), model, message)
    }
}

impl FaceBackend for OnnxBackend {
    fn prepare(&mut self) -> Result<(), StoreError> {
        self.models.detector()?;
        self.models.recognizer()?;
        self.models.swapper()?;
        Ok(())
    }

    fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceDescriptor>, BackendError> {
        let handle = self.models.detector()?;
        let mut detector = handle.model.lock().unwrap_or_else(PoisonError::into_inner);
        faceswap_core::locate(&mut detector, image).map_err(|e| self.failed(DETECTOR, e))
    }

    fn embed(&mut self, image: &RgbImage, face: &FaceDescriptor) -> Result<Embedding, BackendError> {
        let handle = self.models.recognizer()?;
        let mut recognizer = handle.model.lock().unwrap_or_else(PoisonError::into_inner);
        recognizer
            .extract(image, &face.bbox)
            .map_err(|e| self.failed(RECOGNIZER, e))
    }

    fn swap(
        &mut self,
        target: &RgbImage,
        face: &FaceDescriptor,
        source: &FaceDescriptor,
    ) -> Result<RgbImage, BackendError> {
        let embedding = source
            .embedding
            .as_ref()
            .ok_or(BackendError::NotEmbedded { rank: source.rank })?;
        let handle = self.models.swapper()?;
        let mut swapper = handle.model.lock().unwrap_or_else(PoisonError::into_inner);
        swapper
            .swap(target, &face.bbox, embedding)
            .map_err(|e| self.failed(SWAPPER, e))
    }
}
