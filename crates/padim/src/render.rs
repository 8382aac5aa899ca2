//! Five-panel result images: input, ground truth, heat map overlay,
//! predicted mask and segmentation boundaries.

use std::path::{Path, PathBuf};

use image::{imageops, GrayImage, Luma, Rgb, RgbImage};

use crate::error::{PadimError, PadimResult};
use crate::mask;
use crate::pipeline::{ImageArtifacts, InferenceOutput};
use crate::score_map::ScoreMap;

const GAP: u32 = 4;
const HEAT_ALPHA: f32 = 0.5;
const BOUNDARY: Rgb<u8> = Rgb([255, 0, 0]);

/// Matplotlib-style jet colormap, `v` clamped to [0, 1].
pub fn jet(v: f32) -> Rgb<u8> {
    const C: [(f32, [u8; 3]); 6] = [
        (0.0, [0, 0, 128]),
        (0.125, [0, 0, 255]),
        (0.375, [0, 255, 255]),
        (0.625, [255, 255, 0]),
        (0.875, [255, 0, 0]),
        (1.0, [128, 0, 0]),
    ];
    let x = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    let mut i = 0;
    while i + 2 < C.len() && x > C[i + 1].0 {
        i += 1;
    }
    let (x0, c0) = C[i];
    let (x1, c1) = C[i + 1];
    let t = ((x - x0) / (x1 - x0)).clamp(0.0, 1.0);
    let lerp = |a: u8, b: u8| (a as f32 + t * (b as f32 - a as f32)).round() as u8;
    Rgb([lerp(c0[0], c1[0]), lerp(c0[1], c1[1]), lerp(c0[2], c1[2])])
}

/// Heat map colored with `jet` over `[vmin, vmax]`, alpha-blended on `base`.
pub fn heat_overlay(base: &RgbImage, heat: &ScoreMap, vmin: f32, vmax: f32) -> RgbImage {
    let range = if vmax > vmin { vmax - vmin } else { 1.0 };
    let mut out = base.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let (hx, hy) = (x as usize, y as usize);
        if hx >= heat.width() || hy >= heat.height() {
            continue;
        }
        let Rgb(c) = jet((heat.get(hx, hy) - vmin) / range);
        for k in 0..3 {
            let blended = HEAT_ALPHA * c[k] as f32 + (1.0 - HEAT_ALPHA) * px[k] as f32;
            px[k] = blended.round() as u8;
        }
    }
    out
}

/// `base` with the boundaries of `mask` painted red.
pub fn boundary_overlay(base: &RgbImage, mask: &GrayImage) -> RgbImage {
    let edges = mask::boundaries(mask);
    let mut out = base.clone();
    for (x, y, e) in edges.enumerate_pixels() {
        if e[0] > 0 && x < out.width() && y < out.height() {
            out.put_pixel(x, y, BOUNDARY);
        }
    }
    out
}

fn gray_to_rgb(img: &GrayImage) -> RgbImage {
    let mut out = RgbImage::new(img.width(), img.height());
    for (dst, src) in out.pixels_mut().zip(img.pixels()) {
        let v = src[0];
        *dst = Rgb([v, v, v]);
    }
    out
}

fn unit_map_to_gray(map: &ScoreMap) -> GrayImage {
    let mut out = GrayImage::new(map.width() as u32, map.height() as u32);
    for (dst, &v) in out.iter_mut().zip(map.as_slice()) {
        *dst = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    }
    out
}

/// Compose the five panels of one image side by side.
pub fn render_panel(art: &ImageArtifacts, vmin: f32, vmax: f32) -> RgbImage {
    let (w, h) = art.display.dimensions();
    let blank = GrayImage::from_pixel(w, h, Luma([0]));
    let gt = art
        .ground_truth
        .as_ref()
        .map(unit_map_to_gray)
        .unwrap_or_else(|| blank.clone());
    let predicted = art.mask.clone().unwrap_or(blank);

    let panels = [
        art.display.clone(),
        gray_to_rgb(&gt),
        heat_overlay(&art.display, &art.heat_map, vmin, vmax),
        gray_to_rgb(&predicted),
        boundary_overlay(&art.display, &predicted),
    ];
    let mut canvas = RgbImage::from_pixel(
        panels.len() as u32 * (w + GAP) - GAP,
        h,
        Rgb([255, 255, 255]),
    );
    for (i, panel) in panels.iter().enumerate() {
        let x = i as u32 * (w + GAP);
        imageops::replace(&mut canvas, panel, x as i64, 0);
    }
    canvas
}

/// Output file of the panel for `image_path`.
///
/// A `savepath` with an extension is a name template
/// (`out.png` -> `out_<stem>.png`); otherwise it is a directory.
pub fn panel_path(savepath: &Path, image_path: &Path) -> PathBuf {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    match (savepath.file_stem(), savepath.extension()) {
        (Some(base), Some(ext)) => {
            let name = format!(
                "{}_{}.{}",
                base.to_string_lossy(),
                stem,
                ext.to_string_lossy()
            );
            savepath.with_file_name(name)
        }
        _ => savepath.join(format!("{}.png", stem)),
    }
}

/// Write one panel per image; returns the written paths.
///
/// Heat maps share the color range of the whole run.
pub fn save_panels(output: &InferenceOutput, savepath: &Path) -> PadimResult<Vec<PathBuf>> {
    let vmin = output
        .artifacts
        .iter()
        .filter_map(|a| a.heat_map.min())
        .fold(f32::INFINITY, f32::min);
    let vmax = output
        .artifacts
        .iter()
        .filter_map(|a| a.heat_map.max())
        .fold(f32::NEG_INFINITY, f32::max);
    let (vmin, vmax) = if vmin.is_finite() && vmax.is_finite() {
        (vmin, vmax)
    } else {
        (0.0, 1.0)
    };

    let mut written = Vec::with_capacity(output.artifacts.len());
    for (result, art) in output.report.images.iter().zip(&output.artifacts) {
        let path = panel_path(savepath, &result.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        render_panel(art, vmin, vmax)
            .save(&path)
            .map_err(|e| PadimError::Image {
                path: path.clone(),
                message: e.to_string(),
            })?;
        tracing::info!("saved {}", path.display());
        written.push(path);
    }
    Ok(written)
}
