//! ArcFace identity embedding (w600k_r50) via ONNX Runtime.
//!
//! The source face of a swap request is aligned to the 112x112 ArcFace
//! template and embedded; the swapper consumes that vector.

use crate::alignment;
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const CROP_SIZE: usize = 112;
// Symmetric normalization: [0, 255] maps onto [-1, 1].
const PIXEL_CENTER: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;
const MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("expected a 512-dim embedding, got {0} values")]
    WrongDimension(usize),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks to align on")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.is_file() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace recognizer"
        );

        Ok(Self { session })
    }

    /// Embed the face at `face`, which must carry detector landmarks.
    ///
    /// The vector is returned as the model emits it. Callers that need unit
    /// length use [`Embedding::normalized`].
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let input = crop_tensor(&alignment::align_face(image, landmarks, CROP_SIZE).image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, values) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(e.to_string()))?;

        into_embedding(values)
    }
}

fn crop_tensor(crop: &RgbImage) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, CROP_SIZE, CROP_SIZE));
    for (x, y, pixel) in crop.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        if x >= CROP_SIZE || y >= CROP_SIZE {
            continue;
        }
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, y, x]] = (value as f32 - PIXEL_CENTER) / PIXEL_CENTER;
        }
    }
    tensor
}

fn into_embedding(values: &[f32]) -> Result<Embedding, RecognizerError> {
    if values.len() != EMBEDDING_DIM {
        return Err(RecognizerError::WrongDimension(values.len()));
    }
    Ok(Embedding {
        values: values.to_vec(),
        model_version: Some(MODEL_VERSION.to_string()),
    })
}
