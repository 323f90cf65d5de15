use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Center point of the box in image coordinates.
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with `other`; 0.0 for degenerate boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let w = ((self.x + self.width).min(other.x + other.width) - self.x.max(other.x)).max(0.0);
        let h = ((self.y + self.height).min(other.y + other.height) - self.y.max(other.y)).max(0.0);
        let inter = w * h;
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// L2 norm of the raw vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Return a unit-length copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm = self.norm();
        let values = if norm > 0.0 {
            self.values.iter().map(|v| v / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }
}

/// A face located in one request image.
///
/// `rank` is the 1-based left-to-right position assigned by the locator.
/// The embedding is only computed for the face a request actually selects.
#[derive(Debug, Clone)]
pub struct FaceDescriptor {
    pub bbox: BoundingBox,
    pub embedding: Option<Embedding>,
    pub rank: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_center() {
        let b = BoundingBox {
            x: 10.0, y: 20.0, width: 100.0, height: 50.0,
            confidence: 0.9, landmarks: None,
        };
        assert_eq!(b.center(), (60.0, 45.0));
    }

    fn square(x: f32, y: f32, side: f32) -> BoundingBox {
        BoundingBox { x, y, width: side, height: side, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_iou_half_shifted_square() {
        // 5x10 overlap over a 150 union.
        let a = square(0.0, 0.0, 10.0);
        let b = square(5.0, 0.0, 10.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
        assert!((b.iou(&a) - a.iou(&b)).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_and_degenerate() {
        assert_eq!(square(0.0, 0.0, 10.0).iou(&square(30.0, 30.0, 10.0)), 0.0);
        assert_eq!(square(0.0, 0.0, 0.0).iou(&square(0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_normalized_unit_length() {
        let e = Embedding { values: vec![3.0, 4.0], model_version: None };
        let n = e.normalized();
        assert!((n.norm() - 1.0).abs() < 1e-6);
        assert!((n.values[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalized_zero_vector() {
        let e = Embedding { values: vec![0.0, 0.0], model_version: None };
        assert_eq!(e.normalized().values, vec![0.0, 0.0]);
    }
}
