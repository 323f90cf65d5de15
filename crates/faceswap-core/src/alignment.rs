//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical square crop using the five
//! InsightFace reference landmarks and least-squares estimation. The same
//! transform is inverted by the swapper to paste a generated face back
//! into the target raster.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// A face crop together with the transform that produced it.
pub struct AlignedFace {
    pub image: RgbImage,
    /// Forward 2×3 transform: source image coordinates → crop coordinates.
    pub matrix: [f32; 6],
}

/// Reference landmark positions for a square crop of `size` pixels.
///
/// Sizes that are multiples of 112 scale the ArcFace template directly.
/// Other sizes (128 for inswapper) scale by `size / 128` and shift the
/// template right by 8 scaled pixels.
pub fn reference_landmarks(size: usize) -> [(f32, f32); 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Overdetermined system A * [a, b, tx, ty]^T = B, two rows per point pair:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // degenerate landmarks: identity scale
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Invert a 2×3 affine transform. Returns `None` for a singular matrix.
pub fn invert_affine(m: &[f32; 6]) -> Option<[f32; 6]> {
    let det = m[0] * m[4] - m[1] * m[3];
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let ia = m[4] * inv_det;
    let ib = -m[1] * inv_det;
    let ic = -m[3] * inv_det;
    let id = m[0] * inv_det;
    Some([
        ia,
        ib,
        -(ia * m[2] + ib * m[5]),
        ic,
        id,
        -(ic * m[2] + id * m[5]),
    ])
}

/// Apply a 2×3 transform to a point.
pub fn apply_affine(m: &[f32; 6], x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Bilinear sample of an RGB raster at a sub-pixel position.
///
/// Out-of-bounds neighbours contribute black, matching the warp border.
pub(crate) fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> [f32; 3] {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let pixel = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let tl = pixel(x0, y0);
    let tr = pixel(x0 + 1, y0);
    let bl = pixel(x0, y0 + 1);
    let br = pixel(x0 + 1, y0 + 1);

    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy
    })
}

/// Warp `image` through a forward transform into a square `out_size` crop.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with black.
fn warp_affine(image: &RgbImage, matrix: &[f32; 6], out_size: usize) -> RgbImage {
    let mut output = RgbImage::new(out_size as u32, out_size as u32);
    let Some(inverse) = invert_affine(matrix) else {
        return output;
    };

    for (ox, oy, px) in output.enumerate_pixels_mut() {
        let (sx, sy) = apply_affine(&inverse, ox as f32, oy as f32);
        let v = sample_bilinear(image, sx, sy);
        *px = Rgb(v.map(|c| c.round().clamp(0.0, 255.0) as u8));
    }

    output
}

/// Align a detected face to a canonical square crop.
///
/// Computes the similarity transform from the five detected landmarks to
/// the reference positions for `size`, and warps the face region into a
/// `size`×`size` crop (112 for ArcFace, 128 for inswapper).
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5], size: usize) -> AlignedFace {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(size));
    let image = warp_affine(image, &matrix, size);
    AlignedFace { image, matrix }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let pts = REFERENCE_LANDMARKS_112;
        let m = estimate_similarity_transform(&pts, &pts);

        assert!((m[0] - 1.0).abs() < 1e-4, "a = {}", m[0]);
        assert!(m[1].abs() < 1e-4, "-b = {}", m[1]);
        assert!(m[2].abs() < 1e-3, "tx = {}", m[2]);
        assert!(m[3].abs() < 1e-4, "b = {}", m[3]);
        assert!((m[4] - 1.0).abs() < 1e-4, "a2 = {}", m[4]);
        assert!(m[5].abs() < 1e-3, "ty = {}", m[5]);
    }

    #[test]
    fn test_scaled_transform() {
        // Source landmarks at 2x scale → transform should have a ≈ 0.5
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112);
        assert!((m[0] - 0.5).abs() < 0.05, "a = {}, expected ~0.5", m[0]);
    }

    #[test]
    fn test_reference_landmarks_inswapper_offset() {
        let refs = reference_landmarks(128);
        for (r, base) in refs.iter().zip(REFERENCE_LANDMARKS_112.iter()) {
            assert!((r.0 - (base.0 + 8.0)).abs() < 1e-4);
            assert!((r.1 - base.1).abs() < 1e-4);
        }
    }

    #[test]
    fn test_reference_landmarks_arcface_unchanged() {
        assert_eq!(reference_landmarks(112), REFERENCE_LANDMARKS_112);
    }

    #[test]
    fn test_invert_affine_roundtrip() {
        let m = [0.8, -0.3, 12.0, 0.3, 0.8, -4.0];
        let inv = invert_affine(&m).unwrap();
        let (x, y) = apply_affine(&m, 37.0, 81.0);
        let (bx, by) = apply_affine(&inv, x, y);
        assert!((bx - 37.0).abs() < 1e-3 && (by - 81.0).abs() < 1e-3, "({bx}, {by})");
    }

    #[test]
    fn test_invert_affine_singular() {
        assert!(invert_affine(&[0.0; 6]).is_none());
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS_112, 112);
        assert_eq!(aligned.image.dimensions(), (112, 112));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS_112, 128);
        assert_eq!(aligned.image.dimensions(), (128, 128));
    }

    #[test]
    fn test_landmark_roundtrip() {
        // A bright patch at the source left eye lands near the reference left eye.
        let mut image = RgbImage::new(200, 200);
        let src_landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        let (lx, ly) = (src_landmarks[0].0 as u32, src_landmarks[0].1 as u32);
        for dy in 0..5 {
            for dx in 0..5 {
                image.put_pixel(lx - 2 + dx, ly - 2 + dy, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&image, &src_landmarks, 112);

        let ref_x = REFERENCE_LANDMARKS_112[0].0.round() as u32;
        let ref_y = REFERENCE_LANDMARKS_112[0].1.round() as u32;
        let mut max_red = 0u8;
        for dy in 0..3 {
            for dx in 0..3 {
                max_red = max_red.max(aligned.image.get_pixel(ref_x - 1 + dx, ref_y - 1 + dy)[0]);
            }
        }
        assert!(max_red > 100, "expected red patch near ({ref_x}, {ref_y}), max={max_red}");
    }
}
