//! Run configuration: backbone choice, preprocessing, augmentation,
//! estimation and scoring parameters.
//!
//! Every struct implements `Default` with the reference PaDiM settings and is
//! `#[serde(default)]`, so a JSON file only needs the fields it overrides.

use std::path::Path;

use crate::error::{PadimError, PadimResult};

/// Backbone architecture whose intermediate layers feed the embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneArch {
    /// ResNet-18, layers 1-3.
    Resnet18,
    /// Wide ResNet-50-2, layers 1-3.
    WideResnet50_2,
    /// Built-in handcrafted statistics pyramid (no network).
    Pooled,
}

impl BackboneArch {
    /// Channel count of each feature layer, finest first.
    pub fn layer_channels(self) -> &'static [usize] {
        match self {
            Self::Resnet18 => &[64, 128, 256],
            Self::WideResnet50_2 => &[256, 512, 1024],
            Self::Pooled => &[12, 12, 12],
        }
    }

    /// Width of the concatenated embedding before channel reduction.
    pub fn total_channels(self) -> usize {
        self.layer_channels().iter().sum()
    }

    /// Number of randomly selected embedding channels kept for modeling.
    pub fn reduced_channels(self) -> usize {
        match self {
            Self::Resnet18 => 100,
            Self::WideResnet50_2 => 550,
            Self::Pooled => 32,
        }
    }

    /// Stable name used in model metadata and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            Self::Resnet18 => "resnet18",
            Self::WideResnet50_2 => "wide_resnet50_2",
            Self::Pooled => "pooled",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "resnet18" => Some(Self::Resnet18),
            "wide_resnet50_2" => Some(Self::WideResnet50_2),
            "pooled" => Some(Self::Pooled),
            _ => None,
        }
    }
}

/// Geometry and normalization of network inputs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Target length of the short image side after resizing.
    pub resize: u32,
    /// Side of the square crop fed to the backbone.
    pub crop: u32,
    /// Per-channel mean subtracted after scaling to [0, 1].
    pub mean: [f32; 3],
    /// Per-channel standard deviation divided after mean subtraction.
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resize: 256,
            crop: 224,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// Test-time and train-time augmentation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AugmentConfig {
    /// Use random rotation + random crop instead of the center crop.
    pub enable: bool,
    /// Number of passes over the image set when augmentation is enabled.
    pub laps: usize,
    /// Rotation angles are drawn uniformly from `[-max_angle_deg, max_angle_deg]`.
    pub max_angle_deg: i32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            enable: false,
            laps: 5,
            max_angle_deg: 10,
        }
    }
}

impl AugmentConfig {
    /// Passes over the image set actually performed.
    pub fn effective_laps(&self) -> usize {
        if self.enable {
            self.laps
        } else {
            1
        }
    }
}

/// Gaussian estimation parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Value added to every covariance diagonal before inversion.
    pub regularization: f32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            regularization: 0.01,
        }
    }
}

/// Heat-map post-processing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Gaussian smoothing sigma (pixels) applied to upsampled distance maps.
    pub smoothing_sigma: f32,
    /// Radius of the disk used to open predicted masks.
    pub opening_radius: u8,
    /// Fixed segmentation threshold on normalized scores; `None` searches the
    /// F1-optimal threshold against ground-truth masks.
    pub threshold: Option<f32>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            smoothing_sigma: 4.0,
            opening_radius: 4,
            threshold: None,
        }
    }
}

/// Complete PaDiM configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PadimConfig {
    pub arch: BackboneArch,
    /// Images per backbone call.
    pub batch_size: usize,
    /// Seed for channel selection and augmentation.
    pub seed: u64,
    pub preprocess: PreprocessConfig,
    pub augment: AugmentConfig,
    pub estimator: EstimatorConfig,
    pub scoring: ScoringConfig,
}

impl Default for PadimConfig {
    fn default() -> Self {
        Self {
            arch: BackboneArch::Resnet18,
            batch_size: 32,
            seed: 1024,
            preprocess: PreprocessConfig::default(),
            augment: AugmentConfig::default(),
            estimator: EstimatorConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl PadimConfig {
    /// Default configuration for a given architecture.
    pub fn for_arch(arch: BackboneArch) -> Self {
        Self {
            arch,
            ..Default::default()
        }
    }

    /// Load a (partial) configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> PadimResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> PadimResult<()> {
        if self.batch_size == 0 {
            return Err(PadimError::Config("batch_size must be >= 1".into()));
        }
        if self.preprocess.crop == 0 {
            return Err(PadimError::Config("crop must be >= 1".into()));
        }
        if self.preprocess.crop > self.preprocess.resize {
            return Err(PadimError::Config(format!(
                "crop ({}) must not exceed resize ({})",
                self.preprocess.crop, self.preprocess.resize
            )));
        }
        if self.preprocess.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(PadimError::Config("std must be finite and > 0".into()));
        }
        if self.augment.enable && self.augment.laps == 0 {
            return Err(PadimError::Config("augment.laps must be >= 1".into()));
        }
        if self.augment.max_angle_deg < 0 {
            return Err(PadimError::Config("augment.max_angle_deg must be >= 0".into()));
        }
        let reg = self.estimator.regularization;
        if !reg.is_finite() || reg < 0.0 {
            return Err(PadimError::Config(
                "regularization must be finite and >= 0".into(),
            ));
        }
        let sigma = self.scoring.smoothing_sigma;
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(PadimError::Config(
                "smoothing_sigma must be finite and > 0".into(),
            ));
        }
        if let Some(t) = self.scoring.threshold {
            if !t.is_finite() {
                return Err(PadimError::Config("threshold must be finite".into()));
            }
        }
        if self.arch.reduced_channels() > self.arch.total_channels() {
            return Err(PadimError::Config(
                "reduced channel count exceeds embedding width".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_settings() {
        let cfg = PadimConfig::default();
        assert_eq!(cfg.arch, BackboneArch::Resnet18);
        assert_eq!(cfg.batch_size, 32);
        assert_eq!(cfg.seed, 1024);
        assert_eq!(cfg.preprocess.resize, 256);
        assert_eq!(cfg.preprocess.crop, 224);
        assert_eq!(cfg.augment.laps, 5);
        assert_eq!(cfg.scoring.smoothing_sigma, 4.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn arch_channel_budget() {
        assert_eq!(BackboneArch::Resnet18.total_channels(), 448);
        assert_eq!(BackboneArch::WideResnet50_2.total_channels(), 1792);
        assert_eq!(BackboneArch::WideResnet50_2.reduced_channels(), 550);
        for arch in [
            BackboneArch::Resnet18,
            BackboneArch::WideResnet50_2,
            BackboneArch::Pooled,
        ] {
            assert_eq!(BackboneArch::from_name(arch.name()), Some(arch));
        }
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{ "arch": "pooled", "augment": { "enable": true } }"#;
        let cfg: PadimConfig = serde_json::from_str(raw).expect("valid json");
        assert_eq!(cfg.arch, BackboneArch::Pooled);
        assert!(cfg.augment.enable);
        assert_eq!(cfg.augment.laps, 5);
        assert_eq!(cfg.batch_size, 32);
    }

    #[test]
    fn validate_rejects_crop_larger_than_resize() {
        let mut cfg = PadimConfig::default();
        cfg.preprocess.crop = 300;
        assert!(matches!(cfg.validate(), Err(PadimError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_laps_with_augmentation() {
        let mut cfg = PadimConfig::default();
        cfg.augment.enable = true;
        cfg.augment.laps = 0;
        assert!(cfg.validate().is_err());
        cfg.augment.enable = false;
        assert_eq!(cfg.augment.effective_laps(), 1);
        assert!(cfg.validate().is_ok());
    }
}
