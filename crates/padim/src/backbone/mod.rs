//! Feature extractor seam.
//!
//! The Gaussian model only sees multi-layer feature pyramids. Where they come
//! from is behind [`FeatureExtractor`]: the built-in [`PooledPyramid`]
//! computes handcrafted local statistics, [`FeatureDumpExtractor`] replays
//! activations exported from a CNN backbone.

mod dump;
mod pooled;

use std::path::Path;

use crate::error::{PadimError, PadimResult};
use crate::preprocess::AugmentGeometry;
use crate::tensor::{FeaturePyramid, Tensor3};

pub use dump::FeatureDumpExtractor;
pub use pooled::PooledPyramid;

/// One preprocessed image handed to an extractor.
#[derive(Debug, Clone, Copy)]
pub struct BackboneInput<'a> {
    /// File the image was read from.
    pub source: &'a Path,
    /// Normalized `3 x crop x crop` input tensor.
    pub tensor: &'a Tensor3,
    /// Augmentation applied to produce `tensor`, if any.
    pub geometry: Option<AugmentGeometry>,
}

/// Maps a batch of input tensors to per-image feature pyramids.
pub trait FeatureExtractor {
    /// Channel count of each produced layer, finest first.
    fn layer_channels(&self) -> Vec<usize>;

    /// Extract one pyramid per input, in input order.
    fn extract(&mut self, batch: &[BackboneInput<'_>]) -> PadimResult<Vec<FeaturePyramid>>;
}

impl<T: FeatureExtractor + ?Sized> FeatureExtractor for Box<T> {
    fn layer_channels(&self) -> Vec<usize> {
        (**self).layer_channels()
    }

    fn extract(&mut self, batch: &[BackboneInput<'_>]) -> PadimResult<Vec<FeaturePyramid>> {
        (**self).extract(batch)
    }
}

/// Fail unless the extractor produces the expected layer layout.
pub fn check_layer_channels(
    extractor: &dyn FeatureExtractor,
    expected: &[usize],
) -> PadimResult<()> {
    let got = extractor.layer_channels();
    if got != expected {
        return Err(PadimError::ShapeMismatch {
            what: "extractor layer channels",
            expected: expected.to_vec(),
            got,
        });
    }
    Ok(())
}
