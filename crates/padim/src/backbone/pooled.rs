#[cfg(feature = "rayon")]
use rayon::prelude::*;

use super::{BackboneInput, FeatureExtractor};
use crate::error::{PadimError, PadimResult};
use crate::tensor::{FeaturePyramid, Tensor3};

const STRIDES: [usize; 3] = [4, 8, 16];
const STATS: usize = 4;

/// Network-free extractor: local statistics pyramid.
///
/// For each input channel and every `s x s` cell (`s` = 4, 8, 16) it emits
/// the mean, standard deviation, mean absolute horizontal gradient and mean
/// absolute vertical gradient, giving `4 * 3 = 12` channels per layer. Output
/// channel `stat * 3 + c` holds statistic `stat` of input channel `c`.
#[derive(Debug, Clone, Default)]
pub struct PooledPyramid;

impl PooledPyramid {
    pub fn new() -> Self {
        Self
    }

    /// Pyramid of a single `3 x H x W` tensor.
    pub fn pyramid(input: &Tensor3) -> PadimResult<FeaturePyramid> {
        let [c_in, h, w] = input.shape();
        if c_in != 3 {
            return Err(PadimError::ShapeMismatch {
                what: "pooled input channels",
                expected: vec![3],
                got: vec![c_in],
            });
        }
        let coarsest = STRIDES[STRIDES.len() - 1];
        if h < coarsest || w < coarsest {
            return Err(PadimError::Backbone(format!(
                "input {}x{} is smaller than the coarsest cell ({})",
                w, h, coarsest
            )));
        }
        let layers = STRIDES.iter().map(|&s| pool_layer(input, s)).collect();
        Ok(FeaturePyramid::new(layers))
    }
}

fn pool_layer(input: &Tensor3, stride: usize) -> Tensor3 {
    let [c_in, h, w] = input.shape();
    let (gh, gw) = (h / stride, w / stride);
    let mut out = Tensor3::zeros(STATS * c_in, gh, gw);
    let n = (stride * stride) as f32;
    for c in 0..c_in {
        let plane = input.channel(c);
        for gy in 0..gh {
            for gx in 0..gw {
                let mut sum = 0.0f32;
                let mut sum_sq = 0.0f32;
                let mut grad_x = 0.0f32;
                let mut grad_y = 0.0f32;
                for y in gy * stride..(gy + 1) * stride {
                    for x in gx * stride..(gx + 1) * stride {
                        let v = plane[y * w + x];
                        sum += v;
                        sum_sq += v * v;
                        if x + 1 < w {
                            grad_x += (plane[y * w + x + 1] - v).abs();
                        }
                        if y + 1 < h {
                            grad_y += (plane[(y + 1) * w + x] - v).abs();
                        }
                    }
                }
                let mean = sum / n;
                let var = (sum_sq / n - mean * mean).max(0.0);
                out.set(c, gy, gx, mean);
                out.set(c_in + c, gy, gx, var.sqrt());
                out.set(2 * c_in + c, gy, gx, grad_x / n);
                out.set(3 * c_in + c, gy, gx, grad_y / n);
            }
        }
    }
    out
}

impl FeatureExtractor for PooledPyramid {
    fn layer_channels(&self) -> Vec<usize> {
        vec![STATS * 3; STRIDES.len()]
    }

    fn extract(&mut self, batch: &[BackboneInput<'_>]) -> PadimResult<Vec<FeaturePyramid>> {
        #[cfg(feature = "rayon")]
        let out = batch
            .par_iter()
            .map(|input| Self::pyramid(input.tensor))
            .collect();
        #[cfg(not(feature = "rayon"))]
        let out = batch
            .iter()
            .map(|input| Self::pyramid(input.tensor))
            .collect();
        out
    }
}
