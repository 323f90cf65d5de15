//! SCRFD face detector (det_10g) via ONNX Runtime.
//!
//! The model sees a 640x640 letterboxed copy of the image and emits, for
//! each of three strides, per-anchor scores, box distances and five-point
//! keypoint offsets. Detections are mapped back to source pixels and
//! de-duplicated with greedy NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INPUT_SIZE: u32 = 640;
const PIXEL_MEAN: f32 = 127.5;
const PIXEL_SCALE: f32 = 1.0 / 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU: f32 = 0.4;
const STRIDES: [u32; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unexpected SCRFD outputs: {0}")]
    UnexpectedOutputs(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    layout: OutputLayout,
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.is_file() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let layout = OutputLayout::from_names(&names)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            named_outputs = layout.named,
            "loaded SCRFD detector"
        );

        Ok(Self { session, layout })
    }

    /// Detect faces, highest confidence first. An empty image has no faces.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = letterbox_tensor(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (heads, &stride) in self.layout.strides.iter().zip(STRIDES.iter()) {
            let (_, scores) = outputs[heads.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores at stride {stride}: {e}")))?;
            let (_, boxes) = outputs[heads.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes at stride {stride}: {e}")))?;
            let (_, keypoints) = outputs[heads.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("keypoints at stride {stride}: {e}")))?;

            let level = StrideOutput {
                stride,
                scores,
                boxes,
                keypoints,
            };
            candidates.extend(level.decode(&letterbox, SCORE_THRESHOLD));
        }

        let faces = suppress_overlaps(candidates, NMS_IOU);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Maps between source image pixels and the padded square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    offset_x: u32,
    offset_y: u32,
    width: u32,
    height: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            scale,
            offset_x: (size - scaled_w) / 2,
            offset_y: (size - scaled_h) / 2,
            width: scaled_w,
            height: scaled_h,
        }
    }

    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.offset_x as f32) / self.scale,
            (y - self.offset_y as f32) / self.scale,
        )
    }
}

/// Resize into the centered letterbox and normalize to NCHW floats.
/// Padding stays at 0.0, which is what the mean pixel normalizes to.
fn letterbox_tensor(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), INPUT_SIZE);
    let resized = imageops::resize(image, letterbox.width, letterbox.height, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x + letterbox.offset_x) as usize;
        let ty = (y + letterbox.offset_y) as usize;
        for (c, &value) in pixel.0.iter().enumerate() {
            tensor[[0, c, ty, tx]] = (value as f32 - PIXEL_MEAN) * PIXEL_SCALE;
        }
    }

    (tensor, letterbox)
}

/// Output tensor positions of the three heads at one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHeads {
    score: usize,
    bbox: usize,
    kps: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct OutputLayout {
    strides: [StrideHeads; 3],
    named: bool,
}

impl OutputLayout {
    /// Match `score_8`, `bbox_16`, `kps_32`... by name when every one is
    /// present. Exports with numeric names are grouped head-major: scores
    /// for strides 8/16/32, then boxes, then keypoints.
    fn from_names(names: &[String]) -> Result<Self, DetectorError> {
        if names.len() < 9 {
            return Err(DetectorError::UnexpectedOutputs(format!(
                "need 9 outputs (3 strides x score/bbox/kps), got {}",
                names.len()
            )));
        }

        let position = |head: &str, stride: u32| {
            let wanted = format!("{head}_{stride}");
            names.iter().position(|n| *n == wanted)
        };
        let named: Option<Vec<StrideHeads>> = STRIDES
            .iter()
            .map(|&s| {
                Some(StrideHeads {
                    score: position("score", s)?,
                    bbox: position("bbox", s)?,
                    kps: position("kps", s)?,
                })
            })
            .collect();

        Ok(match named {
            Some(found) => Self {
                strides: [found[0], found[1], found[2]],
                named: true,
            },
            None => Self {
                strides: std::array::from_fn(|i| StrideHeads {
                    score: i,
                    bbox: i + 3,
                    kps: i + 6,
                }),
                named: false,
            },
        })
    }
}

/// Raw head outputs for one stride level, in letterbox space.
struct StrideOutput<'a> {
    stride: u32,
    scores: &'a [f32],
    boxes: &'a [f32],
    keypoints: &'a [f32],
}

impl StrideOutput<'_> {
    /// Anchors scoring above `threshold`, mapped to source pixels. Box and
    /// keypoint values are distances from the anchor in units of the stride.
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let columns = (INPUT_SIZE / self.stride) as usize;
        let step = self.stride as f32;

        self.scores
            .iter()
            .enumerate()
            .filter(|&(_, &score)| score > threshold)
            .filter_map(|(i, &score)| {
                let cell = i / ANCHORS_PER_CELL;
                let ax = (cell % columns) as f32 * step;
                let ay = (cell / columns) as f32 * step;

                let d = self.boxes.get(i * 4..i * 4 + 4)?;
                let (x1, y1) = letterbox.to_source(ax - d[0] * step, ay - d[1] * step);
                let (x2, y2) = letterbox.to_source(ax + d[2] * step, ay + d[3] * step);

                let landmarks = self.keypoints.get(i * 10..i * 10 + 10).map(|k| {
                    std::array::from_fn(|p| letterbox.to_source(ax + k[2 * p] * step, ay + k[2 * p + 1] * step))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

/// Greedy non-maximum suppression. The result is sorted by confidence, highest first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn face(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_letterbox_wide_image_pads_vertically() {
        let lb = Letterbox::fit(320, 160, 640);
        assert_eq!((lb.width, lb.height), (640, 320));
        assert_eq!((lb.offset_x, lb.offset_y), (0, 160));
        let (x, y) = lb.to_source(200.0, 160.0 + 100.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_odd_padding_stays_inside_input() {
        let lb = Letterbox::fit(333, 1000, 640);
        assert_eq!(lb.height, 640);
        assert!(lb.offset_x + lb.width <= 640);
    }

    #[test]
    fn test_layout_by_name_in_any_order() {
        let layout = OutputLayout::from_names(&names(&[
            "kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32", "score_32",
        ]))
        .unwrap();
        assert!(layout.named);
        assert_eq!(layout.strides[0], StrideHeads { score: 2, bbox: 1, kps: 0 });
        assert_eq!(layout.strides[2], StrideHeads { score: 8, bbox: 7, kps: 6 });
    }

    #[test]
    fn test_layout_numeric_names_are_head_major() {
        let numeric: Vec<String> = (440..449).map(|i: u32| i.to_string()).collect();
        let layout = OutputLayout::from_names(&numeric).unwrap();
        assert!(!layout.named);
        assert_eq!(layout.strides[1], StrideHeads { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_layout_rejects_too_few_outputs() {
        let err = OutputLayout::from_names(&names(&["score_8", "bbox_8", "kps_8"])).unwrap_err();
        assert!(matches!(err, DetectorError::UnexpectedOutputs(_)));
    }

    #[test]
    fn test_decode_single_anchor() {
        // Stride 32 has a 20x20 grid; anchor 1 of the cell at row 2, column 3.
        let anchors = 20 * 20 * ANCHORS_PER_CELL;
        let hit = (2 * 20 + 3) * ANCHORS_PER_CELL + 1;
        let mut scores = vec![0.5; anchors];
        scores[hit] = 0.9;
        let boxes = vec![1.0; anchors * 4];
        let keypoints = vec![0.0; anchors * 10];

        let level = StrideOutput {
            stride: 32,
            scores: &scores,
            boxes: &boxes,
            keypoints: &keypoints,
        };
        let found = level.decode(&Letterbox::fit(640, 640, 640), SCORE_THRESHOLD);

        assert_eq!(found.len(), 1);
        let f = &found[0];
        assert_eq!((f.x, f.y, f.width, f.height), (64.0, 32.0, 64.0, 64.0));
        assert_eq!(f.landmarks.unwrap()[4], (96.0, 64.0));
    }

    #[test]
    fn test_decode_without_keypoints_has_no_landmarks() {
        let level = StrideOutput {
            stride: 8,
            scores: &[0.8],
            boxes: &[2.0, 2.0, 2.0, 2.0],
            keypoints: &[],
        };
        let found = level.decode(&Letterbox::fit(1280, 1280, 640), SCORE_THRESHOLD);
        assert_eq!(found.len(), 1);
        assert!(found[0].landmarks.is_none());
        // Half-scale letterbox doubles distances back in source space.
        assert_eq!(found[0].width, 64.0);
    }

    #[test]
    fn test_suppress_overlaps_keeps_best_of_cluster() {
        let kept = suppress_overlaps(
            vec![
                face(5.0, 5.0, 100.0, 0.8),
                face(300.0, 300.0, 40.0, 0.6),
                face(0.0, 0.0, 100.0, 0.95),
            ],
            NMS_IOU,
        );
        let confidences: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.95, 0.6]);
    }

    #[test]
    fn test_suppress_overlaps_empty() {
        assert!(suppress_overlaps(Vec::new(), NMS_IOU).is_empty());
    }

    #[test]
    fn test_letterbox_tensor_mid_grey_is_near_zero() {
        let image = RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]));
        let (tensor, lb) = letterbox_tensor(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 6.4).abs() < 1e-4);
        assert!(tensor.iter().all(|v| v.abs() < 0.01));
    }

    #[test]
    fn test_letterbox_tensor_padding_and_channels() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 0, 0]));
        let (tensor, _) = letterbox_tensor(&image);
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.9);
        assert!(tensor[[0, 2, 320, 320]] < -0.9);
    }
}
