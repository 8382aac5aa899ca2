use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::result::{
    ImageArtifacts, ImageResult, InferenceOutput, InferenceReport, ThresholdSource,
    REPORT_SCHEMA_V1,
};
use super::{embed_batch, log_batch, prepare_batch};
use crate::backbone::{check_layer_channels, FeatureExtractor};
use crate::config::PadimConfig;
use crate::embedding::ChannelPlan;
use crate::error::{PadimError, PadimResult};
use crate::heatmap;
use crate::mask;
use crate::model::GaussianModel;
use crate::preprocess::{load_mask, prepare_mask};
use crate::score_map::ScoreMap;
use crate::threshold::{optimal_f1_threshold, precision_recall_at, ThresholdChoice};

/// Heat-map frame maps collected over the laps of one image.
struct PendingImage {
    display: Option<image::RgbImage>,
    lap_maps: Vec<ScoreMap>,
}

/// Score test images against a fitted model.
pub(crate) fn run_inference(
    config: &PadimConfig,
    model: &GaussianModel,
    extractor: &mut dyn FeatureExtractor,
    test_paths: &[PathBuf],
    gt_dir: Option<&Path>,
) -> PadimResult<InferenceOutput> {
    config.validate()?;
    if test_paths.is_empty() {
        return Err(PadimError::Config("no test images".into()));
    }
    let arch = model.arch();
    check_layer_channels(extractor, arch.layer_channels())?;
    let plan = ChannelPlan::new(arch.layer_channels(), model.channel_idx())?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let laps = config.augment.effective_laps();
    let crop = config.preprocess.crop;

    let mut pending: Vec<PendingImage> = test_paths
        .iter()
        .map(|_| PendingImage {
            display: None,
            lap_maps: Vec::with_capacity(laps),
        })
        .collect();

    for lap in 0..laps {
        for (b, chunk) in test_paths.chunks(config.batch_size).enumerate() {
            let start = b * config.batch_size;
            log_batch(
                test_paths,
                start,
                config.batch_size,
                config.augment.enable.then_some(lap),
            );
            let prepared = prepare_batch(chunk, config, &mut rng)?;
            let embeddings = embed_batch(extractor, chunk, &prepared, &plan)?;
            for (k, (prep, emb)) in prepared.into_iter().zip(&embeddings).enumerate() {
                let distances = model.distance_map(emb)?;
                let crop_map = heatmap::upsample(&distances, crop);
                let frame_map = match &prep.geometry {
                    Some(g) => heatmap::reverse_augmentation(&crop_map, g),
                    None => crop_map,
                };
                let slot = &mut pending[start + k];
                if slot.display.is_none() {
                    slot.display = Some(prep.display);
                }
                slot.lap_maps.push(frame_map);
            }
        }
    }

    let mut heat_maps = Vec::with_capacity(pending.len());
    let mut displays = Vec::with_capacity(pending.len());
    for p in pending {
        let averaged = heatmap::average(&p.lap_maps)?;
        heat_maps.push(heatmap::smooth(&averaged, config.scoring.smoothing_sigma));
        displays.push(
            p.display
                .ok_or_else(|| PadimError::Config("image was never processed".into()))?,
        );
    }
    let scores: Vec<f32> = heat_maps.iter().map(heatmap::anomaly_score).collect();
    for (path, score) in test_paths.iter().zip(&scores) {
        tracing::info!("{}: anomaly score {:.4}", path.display(), score);
    }

    let (lo, hi) = heatmap::normalize_global(&mut heat_maps);

    let mut ground_truth = Vec::with_capacity(test_paths.len());
    let mut gt_found = Vec::with_capacity(test_paths.len());
    for (path, heat) in test_paths.iter().zip(&heat_maps) {
        match gt_dir {
            Some(dir) => {
                let (gt, found) = load_ground_truth(dir, path, heat, config)?;
                ground_truth.push(Some(gt));
                gt_found.push(found);
            }
            None => {
                ground_truth.push(None);
                gt_found.push(false);
            }
        }
    }

    let (threshold, threshold_source, pixel_metrics) =
        choose_threshold(config, &heat_maps, &ground_truth);

    let mut images = Vec::with_capacity(test_paths.len());
    let mut artifacts = Vec::with_capacity(test_paths.len());
    for (((path, heat), gt), (display, (score, found))) in test_paths
        .iter()
        .zip(heat_maps)
        .zip(ground_truth)
        .zip(displays.into_iter().zip(scores.iter().zip(gt_found)))
    {
        let predicted =
            threshold.map(|t| mask::predict_mask(&heat, t, config.scoring.opening_radius));
        images.push(ImageResult {
            path: path.clone(),
            anomaly_score: *score,
            has_ground_truth: found,
            mask_coverage: predicted.as_ref().map(mask::coverage),
        });
        artifacts.push(ImageArtifacts {
            display,
            heat_map: heat,
            ground_truth: gt,
            mask: predicted,
        });
    }

    let report = InferenceReport {
        schema: REPORT_SCHEMA_V1.to_string(),
        model: model.summary(),
        laps,
        score_range: [lo, hi],
        threshold,
        threshold_source,
        pixel_metrics,
        images,
    };
    Ok(InferenceOutput { report, artifacts })
}

/// Ground truth for `image_path` as `<dir>/<stem>_mask.png`, framed like the
/// heat map. A missing file yields an all-zero mask.
fn load_ground_truth(
    dir: &Path,
    image_path: &Path,
    heat: &ScoreMap,
    config: &PadimConfig,
) -> PadimResult<(ScoreMap, bool)> {
    let stem = image_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mask_path = dir.join(format!("{}_mask.png", stem));
    if !mask_path.is_file() {
        tracing::debug!("no ground truth at {}", mask_path.display());
        return Ok((ScoreMap::zeros(heat.width(), heat.height()), false));
    }
    let raw = load_mask(&mask_path)?;
    let gt = prepare_mask(&raw, &config.preprocess, config.augment.enable);
    if gt.width() != heat.width() || gt.height() != heat.height() {
        return Err(PadimError::ShapeMismatch {
            what: "ground-truth mask",
            expected: vec![heat.height(), heat.width()],
            got: vec![gt.height(), gt.width()],
        });
    }
    Ok((gt, true))
}

/// Threshold from config, or the F1-optimal one when ground truth exists.
fn choose_threshold(
    config: &PadimConfig,
    heat_maps: &[ScoreMap],
    ground_truth: &[Option<ScoreMap>],
) -> (Option<f32>, Option<ThresholdSource>, Option<ThresholdChoice>) {
    let pixels = labelled_pixels(heat_maps, ground_truth);

    if let Some(t) = config.scoring.threshold {
        let metrics = pixels
            .as_ref()
            .and_then(|(labels, scores)| precision_recall_at(labels, scores, t));
        return (Some(t), Some(ThresholdSource::Fixed), metrics);
    }

    let Some((labels, scores)) = pixels else {
        tracing::warn!("no threshold given and no ground truth; masks are skipped");
        return (None, None, None);
    };
    match optimal_f1_threshold(&labels, &scores) {
        Some(choice) => {
            tracing::info!(
                "optimal threshold: {:.6} (F1 {:.4})",
                choice.threshold,
                choice.f1
            );
            (
                Some(choice.threshold),
                Some(ThresholdSource::F1Optimal),
                Some(choice),
            )
        }
        None => {
            tracing::warn!("ground truth has no anomalous pixels; masks are skipped");
            (None, None, None)
        }
    }
}

/// Flattened `(label, score)` pixels over all images, when every image has
/// a ground-truth map.
fn labelled_pixels(
    heat_maps: &[ScoreMap],
    ground_truth: &[Option<ScoreMap>],
) -> Option<(Vec<bool>, Vec<f32>)> {
    let mut labels = Vec::new();
    let mut scores = Vec::new();
    for (heat, gt) in heat_maps.iter().zip(ground_truth) {
        let gt = gt.as_ref()?;
        labels.extend(gt.as_slice().iter().map(|&v| v > 0.5));
        scores.extend_from_slice(heat.as_slice());
    }
    Some((labels, scores))
}
