//! Image preparation for the backbone: resize, crop, augmentation and
//! normalization into CHW tensors, plus the matching ground-truth mask path.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::Rng;

use crate::config::{AugmentConfig, PreprocessConfig};
use crate::error::{PadimError, PadimResult};
use crate::score_map::ScoreMap;
use crate::tensor::Tensor3;
use crate::warp::rotate_rgb_about_center;

/// Augmentation applied to one image, kept so score maps can be mapped back.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AugmentGeometry {
    /// Rotation applied about the resized image center (degrees).
    pub angle_deg: i32,
    /// Crop row offset in the rotated, resized image.
    pub top: u32,
    /// Crop column offset in the rotated, resized image.
    pub left: u32,
    /// `[width, height]` of the resized image.
    pub resized_size: [u32; 2],
}

/// A preprocessed image ready for feature extraction.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Normalized `3 x crop x crop` network input.
    pub tensor: Tensor3,
    /// Image in the frame the heat map is reported in (crop without
    /// augmentation, resized image with augmentation).
    pub display: RgbImage,
    /// Present when the image was augmented.
    pub geometry: Option<AugmentGeometry>,
}

/// Decode an image file into RGB.
pub fn load_rgb(path: &Path) -> PadimResult<RgbImage> {
    let img = image::open(path).map_err(|e| PadimError::Image {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(img.to_rgb8())
}

/// Decode a mask file, keeping only its first (red) channel.
pub fn load_mask(path: &Path) -> PadimResult<GrayImage> {
    let img = image::open(path).map_err(|e| PadimError::Image {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let rgb = img.to_rgb8();
    Ok(GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        Luma([rgb.get_pixel(x, y)[0]])
    }))
}

/// Size after scaling the short side to `resize`, keeping the aspect ratio.
///
/// Returns `(width, height)`; the long side is truncated.
pub fn resized_dims(width: u32, height: u32, resize: u32) -> (u32, u32) {
    if height > width {
        let h = (resize as u64 * height as u64 / width.max(1) as u64) as u32;
        (resize, h)
    } else {
        let w = (resize as u64 * width as u64 / height.max(1) as u64) as u32;
        (w, resize)
    }
}

fn check_min_size(width: u32, height: u32, crop: u32) -> PadimResult<()> {
    if width < crop || height < crop {
        return Err(PadimError::ShapeMismatch {
            what: "resized image",
            expected: vec![crop as usize, crop as usize],
            got: vec![height as usize, width as usize],
        });
    }
    Ok(())
}

/// Square crop centered in the image.
pub fn center_crop<I>(img: &I, crop: u32) -> I
where
    I: CropSource,
{
    let (w, h) = img.dims();
    let top = h.saturating_sub(crop) / 2;
    let left = w.saturating_sub(crop) / 2;
    img.crop_at(left, top, crop)
}

/// Images that can be cropped to a square.
pub trait CropSource: Sized {
    fn dims(&self) -> (u32, u32);
    fn crop_at(&self, left: u32, top: u32, side: u32) -> Self;
}

impl CropSource for RgbImage {
    fn dims(&self) -> (u32, u32) {
        self.dimensions()
    }

    fn crop_at(&self, left: u32, top: u32, side: u32) -> Self {
        imageops::crop_imm(self, left, top, side, side).to_image()
    }
}

impl CropSource for GrayImage {
    fn dims(&self) -> (u32, u32) {
        self.dimensions()
    }

    fn crop_at(&self, left: u32, top: u32, side: u32) -> Self {
        imageops::crop_imm(self, left, top, side, side).to_image()
    }
}

/// Normalize an RGB image into a `3 x H x W` tensor.
pub fn to_tensor(img: &RgbImage, cfg: &PreprocessConfig) -> Tensor3 {
    let (w, h) = img.dimensions();
    let mut t = Tensor3::zeros(3, h as usize, w as usize);
    for (x, y, px) in img.enumerate_pixels() {
        for c in 0..3 {
            let v = px[c] as f32 / 255.0;
            t.set(c, y as usize, x as usize, (v - cfg.mean[c]) / cfg.std[c]);
        }
    }
    t
}

/// Undo [`to_tensor`] for display.
pub fn denormalize(t: &Tensor3, cfg: &PreprocessConfig) -> RgbImage {
    let mut img = RgbImage::new(t.width() as u32, t.height() as u32);
    for y in 0..t.height() {
        for x in 0..t.width() {
            let mut px = [0u8; 3];
            for (c, out) in px.iter_mut().enumerate() {
                let v = (t.get(c, y, x) * cfg.std[c] + cfg.mean[c]) * 255.0;
                *out = v.clamp(0.0, 255.0) as u8;
            }
            img.put_pixel(x as u32, y as u32, Rgb(px));
        }
    }
    img
}

/// Resize + center crop + normalize.
pub fn prepare_plain(img: &RgbImage, cfg: &PreprocessConfig) -> PadimResult<PreparedImage> {
    let (w, h) = img.dimensions();
    let (nw, nh) = resized_dims(w, h, cfg.resize);
    check_min_size(nw, nh, cfg.crop)?;
    let resized = imageops::resize(img, nw, nh, FilterType::Lanczos3);
    let cropped = center_crop(&resized, cfg.crop);
    Ok(PreparedImage {
        tensor: to_tensor(&cropped, cfg),
        display: cropped,
        geometry: None,
    })
}

/// Resize + random rotation + random crop + normalize.
pub fn prepare_augmented<R: Rng + ?Sized>(
    img: &RgbImage,
    cfg: &PreprocessConfig,
    aug: &AugmentConfig,
    rng: &mut R,
) -> PadimResult<PreparedImage> {
    let (w, h) = img.dimensions();
    let (nw, nh) = resized_dims(w, h, cfg.resize);
    check_min_size(nw, nh, cfg.crop)?;
    let resized = imageops::resize(img, nw, nh, FilterType::Lanczos3);

    let max_angle = aug.max_angle_deg.max(0);
    let angle_deg = rng.gen_range(-max_angle..=max_angle);
    let rotated = rotate_rgb_about_center(&resized, angle_deg as f32);

    let top = random_offset(rng, nh - cfg.crop);
    let left = random_offset(rng, nw - cfg.crop);
    let cropped = rotated.crop_at(left, top, cfg.crop);

    Ok(PreparedImage {
        tensor: to_tensor(&cropped, cfg),
        display: resized,
        geometry: Some(AugmentGeometry {
            angle_deg,
            top,
            left,
            resized_size: [nw, nh],
        }),
    })
}

/// Offset drawn from `[0, slack)`, or 0 when there is no slack.
fn random_offset<R: Rng + ?Sized>(rng: &mut R, slack: u32) -> u32 {
    if slack == 0 {
        0
    } else {
        rng.gen_range(0..slack)
    }
}

/// Binary {0, 1} ground-truth map in the heat-map frame.
///
/// Without augmentation the mask is resized and center-cropped like the
/// image; with augmentation it stays in the resized frame.
pub fn prepare_mask(mask: &GrayImage, cfg: &PreprocessConfig, augmented: bool) -> ScoreMap {
    let (w, h) = mask.dimensions();
    let (nw, nh) = resized_dims(w, h, cfg.resize);
    let resized = imageops::resize(mask, nw, nh, FilterType::Nearest);
    let framed = if augmented {
        resized
    } else {
        center_crop(&resized, cfg.crop)
    };
    binary_map(&framed)
}

fn binary_map(mask: &GrayImage) -> ScoreMap {
    let (w, h) = mask.dimensions();
    let data = mask
        .as_raw()
        .iter()
        .map(|&v| if v > 127 { 1.0 } else { 0.0 })
        .collect();
    ScoreMap::from_vec(w as usize, h as usize, data)
        .unwrap_or_else(|_| ScoreMap::zeros(w as usize, h as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn resized_dims_scale_short_side() {
        assert_eq!(resized_dims(900, 900, 256), (256, 256));
        assert_eq!(resized_dims(400, 300, 256), (341, 256));
        assert_eq!(resized_dims(300, 400, 256), (256, 341));
    }

    #[test]
    fn normalization_round_trips_through_denormalize() {
        let cfg = PreprocessConfig::default();
        let img = RgbImage::from_pixel(4, 3, Rgb([200, 100, 50]));
        let t = to_tensor(&img, &cfg);
        assert_eq!(t.shape(), [3, 3, 4]);
        assert_abs_diff_eq!(t.get(0, 0, 0), (200.0 / 255.0 - 0.485) / 0.229, epsilon = 1e-5);
        let back = denormalize(&t, &cfg);
        let px = back.get_pixel(2, 1);
        for (c, want) in [200u8, 100, 50].iter().enumerate() {
            assert!((px[c] as i32 - *want as i32).abs() <= 1);
        }
    }

    #[test]
    fn plain_preparation_produces_crop_sized_tensor() {
        let cfg = PreprocessConfig::default();
        let img = RgbImage::from_pixel(320, 240, Rgb([10, 20, 30]));
        let prep = prepare_plain(&img, &cfg).expect("prepare");
        assert_eq!(prep.tensor.shape(), [3, 224, 224]);
        assert_eq!(prep.display.dimensions(), (224, 224));
        assert!(prep.geometry.is_none());
    }

    #[test]
    fn augmented_preparation_records_geometry_in_range() {
        let cfg = PreprocessConfig::default();
        let aug = AugmentConfig {
            enable: true,
            ..Default::default()
        };
        let img = RgbImage::from_pixel(300, 300, Rgb([90, 90, 90]));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            let prep = prepare_augmented(&img, &cfg, &aug, &mut rng).expect("prepare");
            let g = prep.geometry.expect("geometry");
            assert!((-10..=10).contains(&g.angle_deg));
            assert!(g.top < 32 && g.left < 32);
            assert_eq!(g.resized_size, [256, 256]);
            assert_eq!(prep.tensor.shape(), [3, 224, 224]);
            assert_eq!(prep.display.dimensions(), (256, 256));
        }
    }

    #[test]
    fn too_small_image_is_rejected() {
        let mut cfg = PreprocessConfig::default();
        cfg.resize = 100;
        cfg.crop = 100;
        let img = RgbImage::new(200, 10);
        // Short side 10 -> 100, long side 2000; fits.
        assert!(prepare_plain(&img, &cfg).is_ok());
        cfg.crop = 101;
        assert!(prepare_plain(&img, &cfg).is_err());
    }

    #[test]
    fn mask_is_binarized_and_framed() {
        let cfg = PreprocessConfig::default();
        let mut mask = GrayImage::new(256, 256);
        for y in 100..156 {
            for x in 100..156 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let plain = prepare_mask(&mask, &cfg, false);
        assert_eq!((plain.width(), plain.height()), (224, 224));
        assert_eq!(plain.get(100, 100), 1.0);
        assert_eq!(plain.get(0, 0), 0.0);
        let aug = prepare_mask(&mask, &cfg, true);
        assert_eq!((aug.width(), aug.height()), (256, 256));
        assert_eq!(aug.as_slice().iter().sum::<f32>(), 56.0 * 56.0);
    }

    #[test]
    fn colored_mask_uses_first_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("red_mask.png");
        let mut mask = RgbImage::new(256, 256);
        for y in 0..128 {
            for x in 0..256 {
                mask.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        mask.save(&path).expect("save mask");

        let loaded = load_mask(&path).expect("load mask");
        assert_eq!(loaded.get_pixel(10, 10)[0], 255);
        assert_eq!(loaded.get_pixel(10, 200)[0], 0);

        let map = prepare_mask(&loaded, &PreprocessConfig::default(), false);
        let positives = map.as_slice().iter().filter(|&&v| v > 0.5).count();
        assert_eq!(positives, 224 * (128 - 16));
    }
}
