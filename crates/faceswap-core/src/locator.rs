//! Face locator: deterministic left-to-right face ordering.
//!
//! Face indices in requests are 1-based positions in this ordering, so the
//! sort key must be total: center x ascending, then center y ascending, then
//! detector confidence descending.

use crate::detector::{DetectorError, FaceDetector};
use crate::types::{BoundingBox, FaceDescriptor};
use image::RgbImage;
use std::cmp::Ordering;

/// Sort detections left-to-right and assign 1-based ranks.
pub fn order_faces(mut faces: Vec<BoundingBox>) -> Vec<FaceDescriptor> {
    faces.sort_by(compare_position);
    faces
        .into_iter()
        .enumerate()
        .map(|(i, bbox)| FaceDescriptor {
            bbox,
            embedding: None,
            rank: i + 1,
        })
        .collect()
}

fn compare_position(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ax.total_cmp(&bx)
        .then_with(|| ay.total_cmp(&by))
        .then_with(|| b.confidence.total_cmp(&a.confidence))
}

/// Detect and order the faces in `image`. No faces is an empty list, not an error.
pub fn locate(detector: &mut FaceDetector, image: &RgbImage) -> Result<Vec<FaceDescriptor>, DetectorError> {
    let faces = detector.detect(image)?;
    Ok(order_faces(faces))
}
