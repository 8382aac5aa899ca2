//! High-level PaDiM API.
//!
//! [`Padim`] wraps a [`PadimConfig`] and runs fitting and inference against
//! any [`FeatureExtractor`].

use std::path::{Path, PathBuf};

use crate::backbone::FeatureExtractor;
use crate::config::{BackboneArch, PadimConfig};
use crate::error::PadimResult;
use crate::model::GaussianModel;
use crate::pipeline::{self, InferenceOutput};

/// Primary entry point.
///
/// Create once, fit on a directory of normal images, then score test images.
///
/// # Examples
///
/// ```no_run
/// use padim::{BackboneArch, Padim, PooledPyramid};
/// use std::path::PathBuf;
///
/// let padim = Padim::new(BackboneArch::Pooled);
/// let mut extractor = PooledPyramid::new();
/// let train = vec![PathBuf::from("train/000.png"), PathBuf::from("train/001.png")];
/// let model = padim.fit(&mut extractor, &train).unwrap();
/// let out = padim
///     .infer(&model, &mut extractor, &[PathBuf::from("test/000.png")], None)
///     .unwrap();
/// println!("score {}", out.report.images[0].anomaly_score);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Padim {
    config: PadimConfig,
}

impl Padim {
    /// Default settings for the given backbone.
    pub fn new(arch: BackboneArch) -> Self {
        Self {
            config: PadimConfig::for_arch(arch),
        }
    }

    /// Create with full config control.
    pub fn with_config(config: PadimConfig) -> Self {
        Self { config }
    }

    /// Access the current configuration.
    pub fn config(&self) -> &PadimConfig {
        &self.config
    }

    /// Mutable access to configuration for post-construction tuning.
    pub fn config_mut(&mut self) -> &mut PadimConfig {
        &mut self.config
    }

    /// Estimate the normal-image distribution from `train_paths`.
    pub fn fit(
        &self,
        extractor: &mut dyn FeatureExtractor,
        train_paths: &[PathBuf],
    ) -> PadimResult<GaussianModel> {
        pipeline::fit_model(&self.config, extractor, train_paths)
    }

    /// Score `test_paths` against `model`.
    ///
    /// With `gt_dir`, masks are looked up as `<gt_dir>/<stem>_mask.png` and
    /// used to pick the segmentation threshold when none is configured.
    pub fn infer(
        &self,
        model: &GaussianModel,
        extractor: &mut dyn FeatureExtractor,
        test_paths: &[PathBuf],
        gt_dir: Option<&Path>,
    ) -> PadimResult<InferenceOutput> {
        pipeline::run_inference(&self.config, model, extractor, test_paths, gt_dir)
    }
}
