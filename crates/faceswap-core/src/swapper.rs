//! inswapper face swap engine via ONNX Runtime.
//!
//! Aligns the target face to a 128×128 crop, runs the swap model with the
//! source identity latent, and pastes the generated face back into a copy
//! of the target raster with a feathered edge.

use crate::alignment::{self, apply_affine, invert_affine, sample_bilinear};
use crate::types::{BoundingBox, Embedding};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array4};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INSWAPPER_INPUT_SIZE: usize = 128;
const INSWAPPER_LATENT_DIM: usize = 512;
/// Width of the blend ramp at the crop border, as a fraction of the crop size.
const PASTE_FEATHER_RATIO: f32 = 0.1;

#[derive(Error, Debug)]
pub enum SwapperError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("embedding map must be {expected} floats, got {actual}")]
    InvalidEmbeddingMap { expected: usize, actual: usize },
    #[error("source embedding must be {expected}-dim, got {actual}")]
    EmbeddingDimension { expected: usize, actual: usize },
    #[error("target face has no landmarks; detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// inswapper-based face swapper.
pub struct FaceSwapper {
    session: Session,
    /// Row-major 512×512 identity projection read from the model graph.
    emap: Vec<f32>,
    target_input: String,
    source_input: String,
}

impl FaceSwapper {
    /// Load the swap model from `model_path`.
    ///
    /// `emap` is the model's embedding map initializer; the ONNX container
    /// reader in the model store extracts it from the same file.
    pub fn load(model_path: &Path, emap: Vec<f32>) -> Result<Self, SwapperError> {
        if !model_path.exists() {
            return Err(SwapperError::ModelNotFound(model_path.display().to_string()));
        }
        let expected = INSWAPPER_LATENT_DIM * INSWAPPER_LATENT_DIM;
        if emap.len() != expected {
            return Err(SwapperError::InvalidEmbeddingMap { expected, actual: emap.len() });
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let input_names: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        if input_names.len() < 2 {
            return Err(SwapperError::InferenceFailed(format!(
                "swap model requires 2 inputs (target, source), got {}",
                input_names.len()
            )));
        }

        // Exports name the inputs "target" and "source"; otherwise assume that order.
        let find = |name: &str| input_names.iter().find(|n| n.as_str() == name).cloned();
        let target_input = find("target").unwrap_or_else(|| input_names[0].clone());
        let source_input = find("source").unwrap_or_else(|| input_names[1].clone());

        tracing::info!(
            path = %model_path.display(),
            inputs = ?input_names,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded inswapper model"
        );

        Ok(Self {
            session,
            emap,
            target_input,
            source_input,
        })
    }

    /// Swap the `source` identity onto `target_face` within `target`.
    ///
    /// `target` is never modified; the composited result is a new raster of
    /// identical dimensions and pixel format.
    pub fn swap(
        &mut self,
        target: &RgbImage,
        target_face: &BoundingBox,
        source: &Embedding,
    ) -> Result<RgbImage, SwapperError> {
        let landmarks = target_face.landmarks.as_ref().ok_or(SwapperError::NoLandmarks)?;
        let latent = project_latent(source, &self.emap)?;

        let aligned = alignment::align_face(target, landmarks, INSWAPPER_INPUT_SIZE);
        let blob = to_blob(&aligned.image);

        let outputs = self.session.run(ort::inputs![
            self.target_input.as_str() => TensorRef::from_array_view(blob.view())?,
            self.source_input.as_str() => TensorRef::from_array_view(latent.view())?,
        ])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapperError::InferenceFailed(format!("swap output: {e}")))?;

        let swapped = from_blob(raw)?;
        Ok(paste_back(target, &swapped, &aligned.matrix))
    }
}

/// Project a source identity through the embedding map: `normalize(normalize(e) · emap)`.
fn project_latent(source: &Embedding, emap: &[f32]) -> Result<Array2<f32>, SwapperError> {
    if source.values.len() != INSWAPPER_LATENT_DIM {
        return Err(SwapperError::EmbeddingDimension {
            expected: INSWAPPER_LATENT_DIM,
            actual: source.values.len(),
        });
    }
    let normed = source.normalized();

    let mut latent = Array2::<f32>::zeros((1, INSWAPPER_LATENT_DIM));
    for (i, &v) in normed.values.iter().enumerate() {
        let row = &emap[i * INSWAPPER_LATENT_DIM..(i + 1) * INSWAPPER_LATENT_DIM];
        for (j, &w) in row.iter().enumerate() {
            latent[[0, j]] += v * w;
        }
    }

    let norm = latent.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        latent.mapv_inplace(|x| x / norm);
    }
    Ok(latent)
}

/// RGB crop → NCHW tensor scaled to [0, 1].
fn to_blob(crop: &RgbImage) -> Array4<f32> {
    let size = INSWAPPER_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in crop.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// NCHW [0, 1] model output → RGB crop.
fn from_blob(raw: &[f32]) -> Result<RgbImage, SwapperError> {
    let size = INSWAPPER_INPUT_SIZE;
    let plane = size * size;
    if raw.len() != 3 * plane {
        return Err(SwapperError::InferenceFailed(format!(
            "expected {} output values, got {}",
            3 * plane,
            raw.len()
        )));
    }

    Ok(RgbImage::from_fn(size as u32, size as u32, |x, y| {
        let idx = y as usize * size + x as usize;
        Rgb(std::array::from_fn(|c| {
            (raw[c * plane + idx] * 255.0).round().clamp(0.0, 255.0) as u8
        }))
    }))
}

/// Blend the swapped crop back into a copy of `target`.
///
/// `matrix` maps target coordinates to crop coordinates. Only pixels whose
/// crop position falls inside the crop are touched; weights ramp linearly
/// from 0 at the crop border to 1 at `PASTE_FEATHER_RATIO` inward.
fn paste_back(target: &RgbImage, face: &RgbImage, matrix: &[f32; 6]) -> RgbImage {
    let mut output = target.clone();
    let Some(inverse) = invert_affine(matrix) else {
        return output;
    };

    let size = face.width() as f32;
    let edge = size - 1.0;
    let feather = (size * PASTE_FEATHER_RATIO).max(1.0);

    // Bounding rectangle of the crop in target space.
    let corners = [(0.0, 0.0), (edge, 0.0), (0.0, edge), (edge, edge)]
        .map(|(u, v)| apply_affine(&inverse, u, v));
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, target.width() as i64 - 1) as u32;
    let max_y = (corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, target.height() as i64 - 1) as u32;

    for y in min_y..=max_y.min(target.height().saturating_sub(1)) {
        for x in min_x..=max_x.min(target.width().saturating_sub(1)) {
            let (u, v) = apply_affine(matrix, x as f32, y as f32);
            if !(0.0..=edge).contains(&u) || !(0.0..=edge).contains(&v) {
                continue;
            }
            let border = u.min(v).min(edge - u).min(edge - v);
            let weight = (border / feather).clamp(0.0, 1.0);
            if weight <= 0.0 {
                continue;
            }

            let generated = sample_bilinear(face, u, v);
            let px = output.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended = generated[c] * weight + px[c] as f32 * (1.0 - weight);
                px[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}
