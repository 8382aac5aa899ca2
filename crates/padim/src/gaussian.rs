//! Streaming per-location Gaussian estimation.
//!
//! Each grid location keeps a running mean and scatter matrix
//! `sum (x - mean)(x - mean)^T`. Batches are folded in with the pairwise
//! update of Chan, Golub and LeVeque, so the result equals the two-pass
//! estimate regardless of batch boundaries.

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::config::BackboneArch;
use crate::embedding::Embedding;
use crate::error::{PadimError, PadimResult};
use crate::model::GaussianModel;

/// Running mean/scatter state for every location of an embedding grid.
#[derive(Debug, Clone)]
pub struct GaussianAccumulator {
    dim: usize,
    height: usize,
    width: usize,
    count: usize,
    /// Location-major means, `locations * dim`.
    mean: Vec<f32>,
    scatter: Vec<DMatrix<f32>>,
}

impl GaussianAccumulator {
    pub fn new(dim: usize, height: usize, width: usize) -> Self {
        let locations = height * width;
        Self {
            dim,
            height,
            width,
            count: 0,
            mean: vec![0.0; locations * dim],
            scatter: vec![DMatrix::zeros(dim, dim); locations],
        }
    }

    /// Samples folded in so far.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn locations(&self) -> usize {
        self.height * self.width
    }

    /// Running mean at a location.
    pub fn mean(&self, loc: usize) -> &[f32] {
        &self.mean[loc * self.dim..(loc + 1) * self.dim]
    }

    /// Unregularized sample covariance (`N - 1` denominator) at a location.
    pub fn covariance(&self, loc: usize) -> Option<DMatrix<f32>> {
        if self.count < 2 {
            return None;
        }
        Some(&self.scatter[loc] / (self.count - 1) as f32)
    }

    /// Fold a batch of embeddings into the running statistics.
    pub fn push_batch(&mut self, batch: &[Embedding]) -> PadimResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for e in batch {
            if e.dim() != self.dim || e.height() != self.height || e.width() != self.width {
                return Err(PadimError::ShapeMismatch {
                    what: "embedding",
                    expected: vec![self.dim, self.height, self.width],
                    got: vec![e.dim(), e.height(), e.width()],
                });
            }
        }

        let n_prev = self.count;
        let dim = self.dim;
        let update = |(loc, (mean, scatter)): (usize, (&mut [f32], &mut DMatrix<f32>))| {
            merge_location(loc, mean, scatter, batch, n_prev);
        };

        #[cfg(feature = "rayon")]
        self.mean
            .par_chunks_mut(dim)
            .zip(self.scatter.par_iter_mut())
            .enumerate()
            .for_each(update);
        #[cfg(not(feature = "rayon"))]
        self.mean
            .chunks_mut(dim)
            .zip(self.scatter.iter_mut())
            .enumerate()
            .for_each(update);

        self.count += batch.len();
        tracing::debug!(
            "accumulated batch of {} (total {})",
            batch.len(),
            self.count
        );
        Ok(())
    }

    /// Turn the statistics into a model with regularized inverse covariances.
    ///
    /// The covariance is `scatter / (N - 1) + regularization * I`.
    pub fn finalize(
        self,
        regularization: f32,
        arch: BackboneArch,
        channel_idx: Vec<usize>,
    ) -> PadimResult<GaussianModel> {
        if self.count < 2 {
            return Err(PadimError::NotEnoughSamples {
                needed: 2,
                got: self.count,
            });
        }
        if channel_idx.len() != self.dim {
            return Err(PadimError::ShapeMismatch {
                what: "channel index",
                expected: vec![self.dim],
                got: vec![channel_idx.len()],
            });
        }
        let denom = (self.count - 1) as f32;
        let invert = |(loc, scatter): (usize, DMatrix<f32>)| {
            let mut cov = scatter / denom;
            for i in 0..cov.nrows() {
                cov[(i, i)] += regularization;
            }
            invert_spd(cov).ok_or(PadimError::SingularCovariance { location: loc })
        };

        #[cfg(feature = "rayon")]
        let precision: PadimResult<Vec<DMatrix<f32>>> =
            self.scatter.into_par_iter().enumerate().map(invert).collect();
        #[cfg(not(feature = "rayon"))]
        let precision: PadimResult<Vec<DMatrix<f32>>> =
            self.scatter.into_iter().enumerate().map(invert).collect();

        Ok(GaussianModel {
            arch,
            channel_idx,
            height: self.height,
            width: self.width,
            dim: self.dim,
            n_samples: self.count,
            regularization,
            mean: self.mean,
            precision: precision?,
        })
    }
}

fn merge_location(
    loc: usize,
    mean: &mut [f32],
    scatter: &mut DMatrix<f32>,
    batch: &[Embedding],
    n_prev: usize,
) {
    let dim = mean.len();
    let nb = batch.len();
    let mut batch_mean = DVector::<f32>::zeros(dim);
    for e in batch {
        for (m, &v) in batch_mean.iter_mut().zip(e.vector(loc)) {
            *m += v;
        }
    }
    batch_mean /= nb as f32;

    let centered = DMatrix::from_fn(dim, nb, |r, c| batch[c].vector(loc)[r] - batch_mean[r]);
    scatter.gemm(1.0, &centered, &centered.transpose(), 1.0);

    let n_total = (n_prev + nb) as f32;
    let delta = DVector::from_fn(dim, |i, _| batch_mean[i] - mean[i]);
    let cross = n_prev as f32 * nb as f32 / n_total;
    scatter.ger(cross, &delta, &delta, 1.0);

    let w = nb as f32 / n_total;
    for (m, d) in mean.iter_mut().zip(delta.iter()) {
        *m += d * w;
    }
}

/// Inverse of a symmetric positive definite matrix; falls back to LU when
/// Cholesky fails.
pub(crate) fn invert_spd(m: DMatrix<f32>) -> Option<DMatrix<f32>> {
    match m.clone().cholesky() {
        Some(chol) => Some(chol.inverse()),
        None => m.try_inverse(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::embedding_from_vectors;
    use approx::assert_relative_eq;

    fn sample_vectors() -> Vec<Vec<f32>> {
        vec![
            vec![1.0, 2.0, 0.5],
            vec![2.0, 1.0, 0.0],
            vec![0.0, 0.5, 1.5],
            vec![3.0, 2.5, 1.0],
            vec![1.5, 0.0, 2.0],
            vec![2.5, 1.5, 0.5],
        ]
    }

    fn two_pass_covariance(xs: &[Vec<f32>]) -> (Vec<f64>, Vec<Vec<f64>>) {
        let n = xs.len() as f64;
        let d = xs[0].len();
        let mut mean = vec![0.0f64; d];
        for x in xs {
            for i in 0..d {
                mean[i] += x[i] as f64 / n;
            }
        }
        let mut cov = vec![vec![0.0f64; d]; d];
        for x in xs {
            for i in 0..d {
                for j in 0..d {
                    cov[i][j] += (x[i] as f64 - mean[i]) * (x[j] as f64 - mean[j]) / (n - 1.0);
                }
            }
        }
        (mean, cov)
    }

    #[test]
    fn batched_estimate_matches_two_pass() {
        let xs = sample_vectors();
        let (mean, cov) = two_pass_covariance(&xs);
        for split in [1usize, 2, 4, 6] {
            let mut acc = GaussianAccumulator::new(3, 1, 1);
            for chunk in xs.chunks(split) {
                let batch: Vec<Embedding> =
                    chunk.iter().map(|v| embedding_from_vectors(1, 1, &[v.clone()])).collect();
                acc.push_batch(&batch).expect("push");
            }
            assert_eq!(acc.count(), 6);
            for i in 0..3 {
                assert_relative_eq!(acc.mean(0)[i] as f64, mean[i], epsilon = 1e-5);
            }
            let c = acc.covariance(0).expect("cov");
            for i in 0..3 {
                for j in 0..3 {
                    assert_relative_eq!(c[(i, j)] as f64, cov[i][j], epsilon = 1e-4);
                }
            }
        }
    }

    #[test]
    fn locations_are_independent() {
        let mut acc = GaussianAccumulator::new(1, 1, 2);
        let batch = vec![
            embedding_from_vectors(1, 2, &[vec![0.0], vec![10.0]]),
            embedding_from_vectors(1, 2, &[vec![2.0], vec![10.0]]),
        ];
        acc.push_batch(&batch).expect("push");
        assert_relative_eq!(acc.mean(0)[0], 1.0);
        assert_relative_eq!(acc.mean(1)[0], 10.0);
        assert_relative_eq!(acc.covariance(0).expect("cov")[(0, 0)], 2.0);
        assert_relative_eq!(acc.covariance(1).expect("cov")[(0, 0)], 0.0);
    }

    #[test]
    fn finalize_regularizes_degenerate_locations() {
        let mut acc = GaussianAccumulator::new(2, 1, 1);
        let batch: Vec<Embedding> = (0..4)
            .map(|_| embedding_from_vectors(1, 1, &[vec![1.0, 1.0]]))
            .collect();
        acc.push_batch(&batch).expect("push");
        let model = acc
            .finalize(0.01, BackboneArch::Pooled, vec![0, 1])
            .expect("finalize");
        // Zero covariance + 0.01 I inverts to 100 I.
        assert_relative_eq!(model.precision[0][(0, 0)], 100.0, epsilon = 1e-3);
        assert_relative_eq!(model.precision[0][(0, 1)], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn finalize_requires_two_samples() {
        let mut acc = GaussianAccumulator::new(1, 1, 1);
        acc.push_batch(&[embedding_from_vectors(1, 1, &[vec![1.0]])])
            .expect("push");
        let err = acc
            .finalize(0.01, BackboneArch::Pooled, vec![0])
            .expect_err("one sample");
        assert!(matches!(err, PadimError::NotEnoughSamples { got: 1, .. }));
    }

    #[test]
    fn unregularized_singular_covariance_is_reported() {
        let mut acc = GaussianAccumulator::new(2, 1, 1);
        let batch: Vec<Embedding> = (0..3)
            .map(|_| embedding_from_vectors(1, 1, &[vec![1.0, 2.0]]))
            .collect();
        acc.push_batch(&batch).expect("push");
        let err = acc
            .finalize(0.0, BackboneArch::Pooled, vec![0, 1])
            .expect_err("zero covariance");
        assert!(matches!(err, PadimError::SingularCovariance { location: 0 }));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut acc = GaussianAccumulator::new(2, 1, 1);
        let err = acc
            .push_batch(&[embedding_from_vectors(1, 1, &[vec![1.0, 2.0, 3.0]])])
            .expect_err("wrong dim");
        assert!(matches!(err, PadimError::ShapeMismatch { .. }));
        assert_eq!(acc.count(), 0);
    }
}
