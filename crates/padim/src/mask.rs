//! Binary segmentation masks from normalized heat maps.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;

use crate::score_map::ScoreMap;

const FOREGROUND: u8 = 255;

/// `score > threshold` becomes foreground (255).
pub fn binarize(map: &ScoreMap, threshold: f32) -> GrayImage {
    let mut out = GrayImage::new(map.width() as u32, map.height() as u32);
    for (dst, &v) in out.iter_mut().zip(map.as_slice()) {
        *dst = if v > threshold { FOREGROUND } else { 0 };
    }
    out
}

/// Morphological opening with a disk of the given radius.
///
/// Removes foreground specks smaller than the disk; radius 0 is a no-op.
pub fn open(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    imageproc::morphology::open(mask, Norm::L2, radius)
}

/// Threshold and open in one step.
pub fn predict_mask(map: &ScoreMap, threshold: f32, opening_radius: u8) -> GrayImage {
    open(&binarize(map, threshold), opening_radius)
}

/// Pixels on either side of a foreground/background transition
/// (4-neighbourhood).
pub fn boundaries(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = mask.get_pixel(x, y)[0];
            let neighbours = [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ];
            let edge = neighbours
                .iter()
                .filter(|&&(nx, ny)| nx < w && ny < h)
                .any(|&(nx, ny)| mask.get_pixel(nx, ny)[0] != v);
            if edge {
                out.put_pixel(x, y, Luma([FOREGROUND]));
            }
        }
    }
    out
}

/// Fraction of foreground pixels.
pub fn coverage(mask: &GrayImage) -> f32 {
    let n = mask.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    mask.as_raw().iter().filter(|&&v| v > 0).count() as f32 / n as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_map(size: usize, lo: usize, hi: usize, value: f32) -> ScoreMap {
        let mut m = ScoreMap::zeros(size, size);
        for y in lo..hi {
            for x in lo..hi {
                m.set(x, y, value);
            }
        }
        m
    }

    #[test]
    fn binarize_is_strictly_greater() {
        let m = ScoreMap::from_vec(3, 1, vec![0.2, 0.5, 0.7]).expect("valid");
        let b = binarize(&m, 0.5);
        assert_eq!(b.as_raw(), &vec![0, 0, 255]);
    }

    #[test]
    fn opening_removes_specks_and_keeps_blobs() {
        let mut m = square_map(40, 10, 30, 1.0);
        m.set(2, 2, 1.0);
        let mask = predict_mask(&m, 0.5, 4);
        assert_eq!(mask.get_pixel(2, 2)[0], 0);
        assert_eq!(mask.get_pixel(20, 20)[0], 255);
    }

    #[test]
    fn zero_radius_keeps_mask() {
        let m = square_map(8, 2, 4, 1.0);
        let b = binarize(&m, 0.5);
        assert_eq!(open(&b, 0), b);
    }

    #[test]
    fn boundaries_trace_both_sides_of_the_edge() {
        let b = binarize(&square_map(10, 3, 7, 1.0), 0.5);
        let e = boundaries(&b);
        assert_eq!(e.get_pixel(3, 5)[0], 255);
        assert_eq!(e.get_pixel(2, 5)[0], 255);
        assert_eq!(e.get_pixel(5, 5)[0], 0);
        assert_eq!(e.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn coverage_counts_foreground() {
        let b = binarize(&square_map(10, 0, 5, 1.0), 0.5);
        assert!((coverage(&b) - 0.25).abs() < 1e-6);
    }
}
