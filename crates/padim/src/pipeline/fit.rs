use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{embed_batch, log_batch, prepare_batch};
use crate::backbone::{check_layer_channels, FeatureExtractor};
use crate::config::PadimConfig;
use crate::embedding::{select_channels, ChannelPlan};
use crate::error::{PadimError, PadimResult};
use crate::gaussian::GaussianAccumulator;
use crate::model::GaussianModel;

/// Estimate the per-location Gaussians of a set of normal images.
pub(crate) fn fit_model(
    config: &PadimConfig,
    extractor: &mut dyn FeatureExtractor,
    train_paths: &[PathBuf],
) -> PadimResult<GaussianModel> {
    config.validate()?;
    if train_paths.is_empty() {
        return Err(PadimError::Config("no training images".into()));
    }
    let arch = config.arch;
    check_layer_channels(extractor, arch.layer_channels())?;

    let channel_idx = select_channels(arch.total_channels(), arch.reduced_channels(), config.seed)?;
    let plan = ChannelPlan::new(arch.layer_channels(), &channel_idx)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let laps = config.augment.effective_laps();

    tracing::info!(
        "fitting {} on {} images ({} lap(s), {} channels)",
        arch.name(),
        train_paths.len(),
        laps,
        plan.dim()
    );

    let mut acc: Option<GaussianAccumulator> = None;
    for lap in 0..laps {
        for (b, chunk) in train_paths.chunks(config.batch_size).enumerate() {
            let start = b * config.batch_size;
            log_batch(
                train_paths,
                start,
                config.batch_size,
                config.augment.enable.then_some(lap),
            );
            let prepared = prepare_batch(chunk, config, &mut rng)?;
            let embeddings = embed_batch(extractor, chunk, &prepared, &plan)?;
            let Some(first) = embeddings.first() else {
                continue;
            };
            let acc = acc.get_or_insert_with(|| {
                GaussianAccumulator::new(first.dim(), first.height(), first.width())
            });
            acc.push_batch(&embeddings)?;
        }
    }

    let acc = acc.ok_or(PadimError::NotEnoughSamples { needed: 2, got: 0 })?;
    tracing::info!(
        "estimating covariance inverses for {} locations",
        acc.locations()
    );
    acc.finalize(config.estimator.regularization, arch, channel_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backbone::PooledPyramid;
    use crate::config::BackboneArch;
    use crate::test_utils::{small_config, write_train_set};

    #[test]
    fn fit_produces_model_on_extractor_grid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = write_train_set(dir.path(), 5, 64);
        let model = fit_model(&small_config(), &mut PooledPyramid::new(), &paths).expect("fit");
        assert_eq!(model.grid(), [16, 16]);
        assert_eq!(model.dim(), 32);
        assert_eq!(model.n_samples(), 5);
        assert_eq!(model.arch(), BackboneArch::Pooled);
    }

    #[test]
    fn augmentation_multiplies_samples_by_laps() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = write_train_set(dir.path(), 3, 80);
        let mut cfg = small_config();
        cfg.augment.enable = true;
        cfg.augment.laps = 2;
        let model = fit_model(&cfg, &mut PooledPyramid::new(), &paths).expect("fit");
        assert_eq!(model.n_samples(), 6);
    }

    #[test]
    fn fit_is_deterministic_for_a_seed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = write_train_set(dir.path(), 4, 64);
        let a = fit_model(&small_config(), &mut PooledPyramid::new(), &paths).expect("fit");
        let b = fit_model(&small_config(), &mut PooledPyramid::new(), &paths).expect("fit");
        assert_eq!(a.channel_idx(), b.channel_idx());
        assert_eq!(a.mean(7), b.mean(7));
    }

    #[test]
    fn empty_train_set_and_wrong_extractor_are_rejected() {
        let cfg = small_config();
        assert!(matches!(
            fit_model(&cfg, &mut PooledPyramid::new(), &[]),
            Err(PadimError::Config(_))
        ));
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = write_train_set(dir.path(), 2, 64);
        let mut resnet = cfg.clone();
        resnet.arch = BackboneArch::Resnet18;
        assert!(matches!(
            fit_model(&resnet, &mut PooledPyramid::new(), &paths),
            Err(PadimError::ShapeMismatch { .. })
        ));
    }
}
