//! Shared helpers for unit tests.

use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{BackboneArch, PadimConfig};
use crate::embedding::Embedding;

/// Embedding on a `height x width` grid from per-location vectors.
pub(crate) fn embedding_from_vectors(height: usize, width: usize, vectors: &[Vec<f32>]) -> Embedding {
    let dim = vectors.first().map_or(0, Vec::len);
    let data: Vec<f32> = vectors.iter().flatten().copied().collect();
    Embedding::from_vec(dim, height, width, data).expect("consistent test embedding")
}

/// Noisy gray texture, optionally with a bright square defect.
pub(crate) fn textured_image(size: u32, seed: u64, defect: Option<(u32, u32, u32)>) -> RgbImage {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut img = RgbImage::new(size, size);
    for (x, y, px) in img.enumerate_pixels_mut() {
        let base = if (x / 4 + y / 4) % 2 == 0 { 90 } else { 150 };
        let v = (base + rng.gen_range(-10i32..=10)) as u8;
        *px = Rgb([v, v, v]);
    }
    if let Some((x0, y0, side)) = defect {
        for y in y0..(y0 + side).min(size) {
            for x in x0..(x0 + side).min(size) {
                img.put_pixel(x, y, Rgb([255, 20, 20]));
            }
        }
    }
    img
}

/// Square mask with one foreground block.
pub(crate) fn block_mask(size: u32, x0: u32, y0: u32, side: u32) -> GrayImage {
    let mut m = GrayImage::new(size, size);
    for y in y0..(y0 + side).min(size) {
        for x in x0..(x0 + side).min(size) {
            m.put_pixel(x, y, Luma([255]));
        }
    }
    m
}

/// Save `count` defect-free textures as `good_XXX.png` under `dir`.
pub(crate) fn write_train_set(dir: &Path, count: usize, size: u32) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("good_{:03}.png", i));
            textured_image(size, i as u64, None)
                .save(&path)
                .expect("save train image");
            path
        })
        .collect()
}

/// Pooled-backbone config sized for 64x64 test images.
pub(crate) fn small_config() -> PadimConfig {
    let mut cfg = PadimConfig::for_arch(BackboneArch::Pooled);
    cfg.preprocess.resize = 64;
    cfg.preprocess.crop = 64;
    cfg.batch_size = 3;
    cfg
}
