//! Training and inference glue.
//!
//! Both directions walk the image list in batches of `batch_size`, once per
//! augmentation lap:
//! load -> preprocess (plain or augmented) -> extract -> embed.
//! Fitting folds the embeddings into a [`GaussianAccumulator`]; inference
//! turns them into distance maps and then heat maps.
//!
//! [`GaussianAccumulator`]: crate::gaussian::GaussianAccumulator

mod fit;
mod infer;
mod result;

use std::path::PathBuf;

use rand::rngs::StdRng;

use crate::backbone::{BackboneInput, FeatureExtractor};
use crate::config::PadimConfig;
use crate::embedding::{embed, ChannelPlan, Embedding};
use crate::error::{PadimError, PadimResult};
use crate::preprocess::{load_rgb, prepare_augmented, prepare_plain, PreparedImage};

pub(crate) use fit::fit_model;
pub(crate) use infer::run_inference;
pub use result::{ImageArtifacts, ImageResult, InferenceOutput, InferenceReport, ThresholdSource};

/// Log the file range covered by a batch.
fn log_batch(paths: &[PathBuf], start: usize, batch_size: usize, lap: Option<usize>) {
    let last = (start + batch_size).min(paths.len()) - 1;
    match lap {
        Some(lap) => tracing::info!(
            "from ({} ~ {}) on augmentation lap {}",
            paths[start].display(),
            paths[last].display(),
            lap
        ),
        None => tracing::info!(
            "from ({} ~ {})",
            paths[start].display(),
            paths[last].display()
        ),
    }
}

/// Load and preprocess a batch of images.
///
/// Augmentation parameters are drawn from `rng` in path order.
fn prepare_batch(
    paths: &[PathBuf],
    config: &PadimConfig,
    rng: &mut StdRng,
) -> PadimResult<Vec<PreparedImage>> {
    paths
        .iter()
        .map(|path| {
            let img = load_rgb(path)?;
            if config.augment.enable {
                prepare_augmented(&img, &config.preprocess, &config.augment, rng)
            } else {
                prepare_plain(&img, &config.preprocess)
            }
        })
        .collect()
}

/// Run the extractor on prepared images and reduce each pyramid to an
/// embedding.
fn embed_batch(
    extractor: &mut dyn FeatureExtractor,
    paths: &[PathBuf],
    prepared: &[PreparedImage],
    plan: &ChannelPlan,
) -> PadimResult<Vec<Embedding>> {
    let inputs: Vec<BackboneInput<'_>> = paths
        .iter()
        .zip(prepared)
        .map(|(path, p)| BackboneInput {
            source: path.as_path(),
            tensor: &p.tensor,
            geometry: p.geometry,
        })
        .collect();
    let pyramids = extractor.extract(&inputs)?;
    if pyramids.len() != inputs.len() {
        return Err(PadimError::Backbone(format!(
            "extractor returned {} pyramids for {} inputs",
            pyramids.len(),
            inputs.len()
        )));
    }
    pyramids.iter().map(|p| embed(p, plan)).collect()
}
