use std::path::PathBuf;

use image::{GrayImage, RgbImage};

use crate::model::ModelSummary;
use crate::score_map::ScoreMap;
use crate::threshold::ThresholdChoice;

pub const REPORT_SCHEMA_V1: &str = "padim.report.v1";

/// Where the segmentation threshold came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    /// Set explicitly in the scoring config.
    Fixed,
    /// Maximizes pixel-level F1 against the ground-truth masks.
    F1Optimal,
}

/// Per-image scoring outcome.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ImageResult {
    pub path: PathBuf,
    /// Maximum of the smoothed, unnormalized heat map.
    pub anomaly_score: f32,
    /// `true` when a ground-truth mask file was found.
    pub has_ground_truth: bool,
    /// Foreground fraction of the predicted mask, if a threshold was available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_coverage: Option<f32>,
}

/// Serializable summary of one inference run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InferenceReport {
    pub schema: String,
    pub model: ModelSummary,
    /// Augmentation passes averaged per image.
    pub laps: usize,
    /// `[min, max]` of the smoothed heat maps before normalization.
    pub score_range: [f32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_source: Option<ThresholdSource>,
    /// Pixel-level precision/recall/F1 at the threshold, when ground truth
    /// with at least one positive pixel is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_metrics: Option<ThresholdChoice>,
    pub images: Vec<ImageResult>,
}

impl InferenceReport {
    /// Image with the highest anomaly score.
    pub fn most_anomalous(&self) -> Option<&ImageResult> {
        self.images
            .iter()
            .max_by(|a, b| a.anomaly_score.total_cmp(&b.anomaly_score))
    }
}

/// In-memory maps of one image, in the frame the heat map is reported in.
#[derive(Debug, Clone)]
pub struct ImageArtifacts {
    /// Image as seen by the heat map (center crop, or resized image when
    /// augmented).
    pub display: RgbImage,
    /// Heat map normalized jointly over all images into [0, 1].
    pub heat_map: ScoreMap,
    /// Binary {0, 1} ground truth, when a ground-truth directory was given.
    pub ground_truth: Option<ScoreMap>,
    /// Opened binary prediction, when a threshold was available.
    pub mask: Option<GrayImage>,
}

/// Report plus per-image artifacts, index-aligned with `report.images`.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub report: InferenceReport,
    pub artifacts: Vec<ImageArtifacts>,
}
