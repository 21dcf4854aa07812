//! Five-point face alignment onto the canonical 112×112 ArcFace layout.
//!
//! A least-squares similarity transform (uniform scale, rotation,
//! translation) maps the detected landmarks onto the reference positions;
//! the RGB crop is then resampled with bilinear interpolation.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output: eyes, nose tip, mouth corners.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

pub const ALIGNED_SIZE: u32 = 112;

/// `x' = a·x − b·y + tx`, `y' = b·x + a·y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Least-squares fit mapping `src` points onto `dst`.
    ///
    /// Falls back to the identity when the points are degenerate.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Self {
        // Normal equations of the stacked rows [x, -y, 1, 0] and [y, x, 0, 1].
        let mut ata = [[0.0f64; 4]; 4];
        let mut atb = [0.0f64; 4];
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
            let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atb[j] += row[j] * rhs;
                }
            }
        }

        match solve4(ata, atb) {
            Some([a, b, tx, ty]) => Self {
                a: a as f32,
                b: b as f32,
                tx: tx as f32,
                ty: ty as f32,
            },
            None => Self::IDENTITY,
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Gaussian elimination with partial pivoting. `None` for a singular system.
#[allow(clippy::needless_range_loop)]
fn solve4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in col + 1..4 {
            let factor = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = (i + 1..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample of `image` at a fractional position; outside pixels are black.
fn sample(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);

    let texel = |px: i64, py: i64| -> [f32; 3] {
        if (0..w).contains(&px) && (0..h).contains(&py) {
            let p = image.get_pixel(px as u32, py as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (p00, p10) = (texel(x0, y0), texel(x0 + 1, y0));
    let (p01, p11) = (texel(x0, y0 + 1), texel(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] * (1.0 - fx) * (1.0 - fy)
            + p10[c] * fx * (1.0 - fy)
            + p01[c] * (1.0 - fx) * fy
            + p11[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp `image` with `transform` into a `size`×`size` output.
pub fn warp(image: &RgbImage, transform: &Similarity, size: u32) -> RgbImage {
    let Some(back) = transform.inverse() else {
        return RgbImage::new(size, size);
    };
    RgbImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = back.apply((ox as f32, oy as f32));
        sample(image, sx, sy)
    })
}

/// Align a face from its five landmarks (image coordinates) to a 112×112 crop.
pub fn align_face(image: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &REFERENCE_LANDMARKS);
    warp(image, &transform, ALIGNED_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_estimate_identity() {
        let t = Similarity::estimate(&REFERENCE_LANDMARKS, &REFERENCE_LANDMARKS);
        assert!(close(t.a, 1.0, 1e-4), "a = {}", t.a);
        assert!(close(t.b, 0.0, 1e-4), "b = {}", t.b);
        assert!(close(t.tx, 0.0, 1e-3), "tx = {}", t.tx);
        assert!(close(t.ty, 0.0, 1e-3), "ty = {}", t.ty);
    }

    #[test]
    fn test_estimate_recovers_scale_and_shift() {
        let src: Vec<(f32, f32)> = REFERENCE_LANDMARKS
            .iter()
            .map(|&(x, y)| (2.0 * x + 10.0, 2.0 * y - 4.0))
            .collect();
        let t = Similarity::estimate(&src, &REFERENCE_LANDMARKS);
        assert!(close(t.a, 0.5, 1e-3), "a = {}", t.a);
        assert!(close(t.b, 0.0, 1e-3), "b = {}", t.b);
        for (s, r) in src.iter().zip(REFERENCE_LANDMARKS.iter()) {
            let (x, y) = t.apply(*s);
            assert!(close(x, r.0, 1e-2) && close(y, r.1, 1e-2));
        }
    }

    #[test]
    fn test_degenerate_points_fall_back_to_identity() {
        let src = [(5.0, 5.0); 5];
        assert_eq!(Similarity::estimate(&src, &REFERENCE_LANDMARKS), Similarity::IDENTITY);
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Similarity {
            a: 0.8,
            b: 0.3,
            tx: 12.0,
            ty: -7.0,
        };
        let back = t.inverse().unwrap();
        let (x, y) = back.apply(t.apply((31.0, 44.0)));
        assert!(close(x, 31.0, 1e-3) && close(y, 44.0, 1e-3));
    }

    #[test]
    fn test_warp_identity_copies_pixels() {
        let image = RgbImage::from_fn(16, 16, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 7]));
        let out = warp(&image, &Similarity::IDENTITY, 16);
        assert_eq!(out, image);
    }

    #[test]
    fn test_align_face_output_size() {
        let image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let aligned = align_face(&image, &REFERENCE_LANDMARKS);
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut image = RgbImage::new(200, 200);
        let landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // Red patch around the left eye.
        for y in 58..63 {
            for x in 78..83 {
                image.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&image, &landmarks);
        let (rx, ry) = REFERENCE_LANDMARKS[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);
        let brightest = (ry - 1..=ry + 1)
            .flat_map(|y| (rx - 1..=rx + 1).map(move |x| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0)
            .max_by_key(|p| p[0])
            .unwrap();
        assert!(brightest[0] > 100, "left eye red = {}", brightest[0]);
        assert_eq!(brightest[2], 0);
    }
}
