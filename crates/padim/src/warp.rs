//! Geometric resampling: bilinear sampling with replicated borders, resize,
//! rotation about the image center and zero padding.
//!
//! Rotation follows the usual 2x3 affine convention: a positive angle rotates
//! the content counter-clockwise as displayed, about `(w / 2, h / 2)`, and the
//! destination pixel `p` is read from the source at `M^-1 p`.

use image::{Rgb, RgbImage};

use crate::score_map::ScoreMap;

/// Sample a row-major plane at a sub-pixel position.
///
/// Neighbour indices are clamped to the plane, which replicates the border.
#[inline]
pub fn bilinear_sample(plane: &[f32], width: usize, height: usize, x: f32, y: f32) -> f32 {
    if width == 0 || height == 0 {
        return 0.0;
    }
    let x0f = x.floor();
    let y0f = y.floor();
    let fx = x - x0f;
    let fy = y - y0f;
    let max_x = (width - 1) as i64;
    let max_y = (height - 1) as i64;
    let x0 = (x0f as i64).clamp(0, max_x) as usize;
    let x1 = (x0f as i64 + 1).clamp(0, max_x) as usize;
    let y0 = (y0f as i64).clamp(0, max_y) as usize;
    let y1 = (y0f as i64 + 1).clamp(0, max_y) as usize;

    let p00 = plane[y0 * width + x0];
    let p10 = plane[y0 * width + x1];
    let p01 = plane[y1 * width + x0];
    let p11 = plane[y1 * width + x1];

    (1.0 - fx) * (1.0 - fy) * p00 + fx * (1.0 - fy) * p10 + (1.0 - fx) * fy * p01 + fx * fy * p11
}

/// Bilinear resize with half-pixel centers.
pub fn resize_bilinear(src: &ScoreMap, width: usize, height: usize) -> ScoreMap {
    let mut out = ScoreMap::zeros(width, height);
    if src.width() == 0 || src.height() == 0 {
        return out;
    }
    let sx = src.width() as f32 / width as f32;
    let sy = src.height() as f32 / height as f32;
    for y in 0..height {
        let src_y = (y as f32 + 0.5) * sy - 0.5;
        for x in 0..width {
            let src_x = (x as f32 + 0.5) * sx - 0.5;
            let v = bilinear_sample(src.as_slice(), src.width(), src.height(), src_x, src_y);
            out.set(x, y, v);
        }
    }
    out
}

/// Inverse rotation: destination `(x, y)` to source coordinates.
#[inline]
fn rotation_source(x: f32, y: f32, cx: f32, cy: f32, cos: f32, sin: f32) -> (f32, f32) {
    let dx = x - cx;
    let dy = y - cy;
    (cos * dx - sin * dy + cx, sin * dx + cos * dy + cy)
}

/// Rotate a plane by `angle_deg` about its center, keeping its size.
pub fn rotate_about_center(src: &ScoreMap, angle_deg: f32) -> ScoreMap {
    let (w, h) = (src.width(), src.height());
    let mut out = ScoreMap::zeros(w, h);
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = rotation_source(x as f32, y as f32, cx, cy, cos, sin);
            out.set(x, y, bilinear_sample(src.as_slice(), w, h, sx, sy));
        }
    }
    out
}

/// Rotate an RGB image by `angle_deg` about its center (bilinear, replicated border).
pub fn rotate_rgb_about_center(src: &RgbImage, angle_deg: f32) -> RgbImage {
    let (w, h) = src.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let planes: Vec<Vec<f32>> = (0..3)
        .map(|c| src.pixels().map(|p| p[c] as f32).collect())
        .collect();
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let cx = w as f32 / 2.0;
    let cy = h as f32 / 2.0;
    let mut out = RgbImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = rotation_source(x as f32, y as f32, cx, cy, cos, sin);
            let mut px = [0u8; 3];
            for (c, plane) in planes.iter().enumerate() {
                let v = bilinear_sample(plane, wu, hu, sx, sy);
                px[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(x, y, Rgb(px));
        }
    }
    out
}

/// Place `src` into a zero canvas of `width x height` with its top-left at `(top, left)`.
///
/// Parts of `src` falling outside the canvas are dropped.
pub fn pad(src: &ScoreMap, width: usize, height: usize, top: usize, left: usize) -> ScoreMap {
    let mut out = ScoreMap::zeros(width, height);
    for y in 0..src.height() {
        let ty = top + y;
        if ty >= height {
            break;
        }
        for x in 0..src.width() {
            let tx = left + x;
            if tx >= width {
                break;
            }
            out.set(tx, ty, src.get(x, y));
        }
    }
    out
}
