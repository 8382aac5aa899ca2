//! padim — patch distribution modeling for image anomaly detection.
//!
//! A per-location multivariate Gaussian is fitted to the patch embeddings of
//! normal training images; test images are scored by the Mahalanobis
//! distance of each patch to its Gaussian. The stages are:
//!
//! 1. **Preprocess** – resize, center or random crop, optional rotation,
//!    ImageNet normalization.
//! 2. **Extract** – a [`FeatureExtractor`] maps input tensors to a
//!    three-layer feature pyramid.
//! 3. **Embed** – coarse layers are tiled onto the finest grid and a seeded
//!    random subset of channels is kept.
//! 4. **Estimate** – streaming per-location mean and covariance, regularized
//!    and inverted into a [`GaussianModel`].
//! 5. **Score** – Mahalanobis distance maps, bilinear upsampling, reversal of
//!    augmentation, Gaussian smoothing, joint min-max normalization.
//! 6. **Segment** – fixed or F1-optimal threshold, morphological opening.
//!
//! # Public API
//! - [`Padim`] as the primary entry point, configured by [`PadimConfig`]
//! - [`GaussianModel`] with safetensors persistence
//! - [`FeatureExtractor`] and the built-in extractors
//! - the scoring building blocks in [`heatmap`], [`threshold`] and [`mask`]

mod api;
mod backbone;
mod config;
mod embedding;
mod error;
mod gaussian;
pub mod heatmap;
pub mod mask;
mod model;
mod pipeline;
mod preprocess;
pub mod render;
mod score_map;
mod tensor;
pub mod threshold;
mod warp;

#[cfg(test)]
pub(crate) mod test_utils;

pub use api::Padim;
pub use backbone::{BackboneInput, FeatureDumpExtractor, FeatureExtractor, PooledPyramid};
pub use config::{
    AugmentConfig, BackboneArch, EstimatorConfig, PadimConfig, PreprocessConfig, ScoringConfig,
};
pub use embedding::{embed, embedding_concat, select_channels, ChannelPlan, Embedding};
pub use error::{PadimError, PadimResult};
pub use gaussian::GaussianAccumulator;
pub use model::{GaussianModel, ModelSummary};
pub use pipeline::{
    ImageArtifacts, ImageResult, InferenceOutput, InferenceReport, ThresholdSource,
};
pub use preprocess::{
    denormalize, load_mask, load_rgb, prepare_augmented, prepare_mask, prepare_plain,
    resized_dims, AugmentGeometry, PreparedImage,
};
pub use score_map::ScoreMap;
pub use tensor::{FeaturePyramid, Tensor3};
pub use warp::{resize_bilinear, rotate_about_center};
