//! Turning grid distance maps into full-resolution heat maps.

use crate::error::{PadimError, PadimResult};
use crate::preprocess::AugmentGeometry;
use crate::score_map::ScoreMap;
use crate::warp::{pad, resize_bilinear, rotate_about_center};

/// Bilinear upsampling of a grid distance map to the `crop x crop` input frame.
pub fn upsample(distances: &ScoreMap, crop: u32) -> ScoreMap {
    resize_bilinear(distances, crop as usize, crop as usize)
}

/// Map a crop-frame heat map back into the resized image frame by undoing
/// the random crop (zero padding) and then the rotation.
pub fn reverse_augmentation(crop_map: &ScoreMap, geometry: &AugmentGeometry) -> ScoreMap {
    let [w, h] = geometry.resized_size;
    let padded = pad(
        crop_map,
        w as usize,
        h as usize,
        geometry.top as usize,
        geometry.left as usize,
    );
    rotate_about_center(&padded, -(geometry.angle_deg as f32))
}

/// Pixel-wise mean of equally sized maps.
pub fn average(maps: &[ScoreMap]) -> PadimResult<ScoreMap> {
    let first = maps
        .first()
        .ok_or_else(|| PadimError::Config("cannot average zero score maps".into()))?;
    let (w, h) = (first.width(), first.height());
    let mut out = ScoreMap::zeros(w, h);
    for m in maps {
        if m.width() != w || m.height() != h {
            return Err(PadimError::ShapeMismatch {
                what: "score map",
                expected: vec![h, w],
                got: vec![m.height(), m.width()],
            });
        }
        for (o, &v) in out.as_mut_slice().iter_mut().zip(m.as_slice()) {
            *o += v;
        }
    }
    let n = maps.len() as f32;
    out.map_in_place(|v| v / n);
    Ok(out)
}

/// Kernel support in standard deviations.
const GAUSSIAN_TRUNCATE: f32 = 4.0;

/// Normalized 1-D Gaussian kernel truncated at `4 * sigma`.
pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as i32;
    let denom = 2.0 * sigma * sigma;
    let mut kernel: Vec<f32> = (-radius..=radius)
        .map(|i| (-((i * i) as f32) / denom).exp())
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian smoothing of a heat map, edges clamped.
pub fn smooth(map: &ScoreMap, sigma: f32) -> ScoreMap {
    if map.width() == 0 || map.height() == 0 || sigma <= 0.0 {
        return map.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let blurred = imageproc::filter::separable_filter_equal(&map.to_image(), &kernel);
    ScoreMap::from_image(&blurred)
}

/// Image-level anomaly score: the maximum of the smoothed heat map.
pub fn anomaly_score(map: &ScoreMap) -> f32 {
    map.max().unwrap_or(0.0)
}

/// Min-max normalize all maps jointly into [0, 1].
///
/// Returns the `(min, max)` used. A constant set of maps becomes all zeros.
pub fn normalize_global(maps: &mut [ScoreMap]) -> (f32, f32) {
    let min = maps
        .iter()
        .filter_map(ScoreMap::min)
        .fold(f32::INFINITY, f32::min);
    let max = maps
        .iter()
        .filter_map(ScoreMap::max)
        .fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 0.0);
    }
    let range = max - min;
    for m in maps.iter_mut() {
        if range > 0.0 {
            m.map_in_place(|v| (v - min) / range);
        } else {
            m.map_in_place(|_| 0.0);
        }
    }
    (min, max)
}
