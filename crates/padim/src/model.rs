//! Learned normal-image distribution and its on-disk form.
//!
//! The model file is a safetensors archive:
//!
//! | tensor        | dtype | shape       |
//! |---------------|-------|-------------|
//! | `mean`        | F32   | `[L, D]`    |
//! | `precision`   | F32   | `[L, D, D]` |
//! | `channel_idx` | I64   | `[D]`       |
//!
//! with `L = height * width` grid locations and `D` reduced channels. The
//! header metadata carries the schema tag, backbone name, grid size, sample
//! count and regularization.

use std::collections::HashMap;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

use crate::config::BackboneArch;
use crate::embedding::Embedding;
use crate::error::{PadimError, PadimResult};
use crate::score_map::ScoreMap;

const MODEL_SCHEMA_V1: &str = "padim.model.v1";

/// Per-location multivariate Gaussians over reduced patch embeddings.
#[derive(Debug, Clone)]
pub struct GaussianModel {
    pub(crate) arch: BackboneArch,
    pub(crate) channel_idx: Vec<usize>,
    pub(crate) height: usize,
    pub(crate) width: usize,
    pub(crate) dim: usize,
    pub(crate) n_samples: usize,
    pub(crate) regularization: f32,
    /// Location-major means, `L * D`.
    pub(crate) mean: Vec<f32>,
    /// Regularized inverse covariance per location.
    pub(crate) precision: Vec<DMatrix<f32>>,
}

/// Model metadata for reporting.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelSummary {
    pub schema: String,
    pub arch: BackboneArch,
    pub grid: [usize; 2],
    pub dim: usize,
    pub n_samples: usize,
    pub regularization: f32,
}

impl GaussianModel {
    pub fn arch(&self) -> BackboneArch {
        self.arch
    }

    /// Embedding channels the model was trained on.
    pub fn channel_idx(&self) -> &[usize] {
        &self.channel_idx
    }

    /// `[height, width]` of the embedding grid.
    pub fn grid(&self) -> [usize; 2] {
        [self.height, self.width]
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn mean(&self, loc: usize) -> &[f32] {
        &self.mean[loc * self.dim..(loc + 1) * self.dim]
    }

    pub fn precision(&self, loc: usize) -> &DMatrix<f32> {
        &self.precision[loc]
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            schema: MODEL_SCHEMA_V1.to_string(),
            arch: self.arch,
            grid: self.grid(),
            dim: self.dim,
            n_samples: self.n_samples,
            regularization: self.regularization,
        }
    }

    /// Mahalanobis distance of `x` to the Gaussian at `loc`.
    pub fn mahalanobis(&self, loc: usize, x: &[f32]) -> f32 {
        let mean = self.mean(loc);
        let diff = DVector::from_iterator(self.dim, x.iter().zip(mean).map(|(a, m)| a - m));
        let d2 = diff.dot(&(&self.precision[loc] * &diff));
        d2.max(0.0).sqrt()
    }

    /// Distance of every embedding location to its Gaussian, as a grid map.
    pub fn distance_map(&self, embedding: &Embedding) -> PadimResult<ScoreMap> {
        if embedding.dim() != self.dim
            || embedding.height() != self.height
            || embedding.width() != self.width
        {
            return Err(PadimError::ShapeMismatch {
                what: "embedding",
                expected: vec![self.dim, self.height, self.width],
                got: vec![embedding.dim(), embedding.height(), embedding.width()],
            });
        }
        let locations = self.height * self.width;

        #[cfg(feature = "rayon")]
        let dist: Vec<f32> = (0..locations)
            .into_par_iter()
            .map(|loc| self.mahalanobis(loc, embedding.vector(loc)))
            .collect();
        #[cfg(not(feature = "rayon"))]
        let dist: Vec<f32> = (0..locations)
            .map(|loc| self.mahalanobis(loc, embedding.vector(loc)))
            .collect();

        ScoreMap::from_vec(self.width, self.height, dist)
    }

    /// Write the model as a safetensors archive.
    pub fn save(&self, path: &Path) -> PadimResult<()> {
        let locations = self.height * self.width;
        let mean_bytes = f32_bytes(&self.mean);
        let mut precision_bytes = Vec::with_capacity(locations * self.dim * self.dim * 4);
        for p in &self.precision {
            for r in 0..self.dim {
                for c in 0..self.dim {
                    precision_bytes.extend_from_slice(&p[(r, c)].to_le_bytes());
                }
            }
        }
        let idx_bytes: Vec<u8> = self
            .channel_idx
            .iter()
            .flat_map(|&i| (i as i64).to_le_bytes())
            .collect();

        let tensors = vec![
            (
                "mean",
                TensorView::new(Dtype::F32, vec![locations, self.dim], &mean_bytes)?,
            ),
            (
                "precision",
                TensorView::new(
                    Dtype::F32,
                    vec![locations, self.dim, self.dim],
                    &precision_bytes,
                )?,
            ),
            (
                "channel_idx",
                TensorView::new(Dtype::I64, vec![self.dim], &idx_bytes)?,
            ),
        ];

        let mut meta = HashMap::new();
        meta.insert("schema".to_string(), MODEL_SCHEMA_V1.to_string());
        meta.insert("arch".to_string(), self.arch.name().to_string());
        meta.insert("height".to_string(), self.height.to_string());
        meta.insert("width".to_string(), self.width.to_string());
        meta.insert("n_samples".to_string(), self.n_samples.to_string());
        meta.insert(
            "regularization".to_string(),
            self.regularization.to_string(),
        );

        safetensors::serialize_to_file(tensors, &Some(meta), path)?;
        tracing::debug!("model written to {}", path.display());
        Ok(())
    }

    /// Read a model written by [`GaussianModel::save`].
    pub fn load(path: &Path) -> PadimResult<Self> {
        let bytes = std::fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let meta = header.metadata().clone().unwrap_or_default();

        let schema = meta_field(&meta, "schema")?;
        if schema != MODEL_SCHEMA_V1 {
            return Err(PadimError::Format(format!(
                "unsupported model schema '{}' (expected '{}')",
                schema, MODEL_SCHEMA_V1
            )));
        }
        let arch_name = meta_field(&meta, "arch")?;
        let arch = BackboneArch::from_name(arch_name)
            .ok_or_else(|| PadimError::Format(format!("unknown arch '{}'", arch_name)))?;
        let height: usize = parse_meta(&meta, "height")?;
        let width: usize = parse_meta(&meta, "width")?;
        let n_samples: usize = parse_meta(&meta, "n_samples")?;
        let regularization: f32 = parse_meta(&meta, "regularization")?;

        let tensors = SafeTensors::deserialize(&bytes)?;
        let idx_view = tensors.tensor("channel_idx")?;
        expect_dtype("channel_idx", idx_view.dtype(), Dtype::I64)?;
        if idx_view.shape().len() != 1 {
            return Err(PadimError::Format(format!(
                "tensor 'channel_idx' has shape {:?}, expected one dimension",
                idx_view.shape()
            )));
        }
        let channel_idx: Vec<usize> = idx_view
            .data()
            .chunks_exact(8)
            .map(|b| {
                let v = i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                usize::try_from(v)
                    .map_err(|_| PadimError::Format(format!("negative channel index {}", v)))
            })
            .collect::<PadimResult<_>>()?;
        let dim = channel_idx.len();
        if dim == 0 {
            return Err(PadimError::Format("model has no channels".into()));
        }
        expect_shape("channel_idx", idx_view.shape(), &[dim])?;
        let locations = height
            .checked_mul(width)
            .filter(|&l| l > 0)
            .ok_or_else(|| PadimError::Format(format!("invalid grid {}x{}", height, width)))?;

        let mean_view = tensors.tensor("mean")?;
        expect_dtype("mean", mean_view.dtype(), Dtype::F32)?;
        expect_shape("mean", mean_view.shape(), &[locations, dim])?;
        let mean = f32_values(mean_view.data());

        let precision_view = tensors.tensor("precision")?;
        expect_dtype("precision", precision_view.dtype(), Dtype::F32)?;
        expect_shape("precision", precision_view.shape(), &[locations, dim, dim])?;
        let flat = f32_values(precision_view.data());
        let precision = flat
            .chunks_exact(dim * dim)
            .map(|block| DMatrix::from_row_slice(dim, dim, block))
            .collect();

        tracing::debug!(
            "loaded {} model: {}x{} grid, {} channels, {} samples",
            arch.name(),
            height,
            width,
            dim,
            n_samples
        );

        Ok(Self {
            arch,
            channel_idx,
            height,
            width,
            dim,
            n_samples,
            regularization,
            mean,
            precision,
        })
    }
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub(crate) fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

fn meta_field<'a>(meta: &'a HashMap<String, String>, key: &str) -> PadimResult<&'a str> {
    meta.get(key)
        .map(String::as_str)
        .ok_or_else(|| PadimError::Format(format!("missing metadata field '{}'", key)))
}

fn parse_meta<T: std::str::FromStr>(meta: &HashMap<String, String>, key: &str) -> PadimResult<T> {
    let raw = meta_field(meta, key)?;
    raw.parse()
        .map_err(|_| PadimError::Format(format!("invalid metadata {}='{}'", key, raw)))
}

pub(crate) fn expect_dtype(name: &str, got: Dtype, want: Dtype) -> PadimResult<()> {
    if got != want {
        return Err(PadimError::Format(format!(
            "tensor '{}' has dtype {:?}, expected {:?}",
            name, got, want
        )));
    }
    Ok(())
}

pub(crate) fn expect_shape(name: &str, got: &[usize], want: &[usize]) -> PadimResult<()> {
    if got != want {
        return Err(PadimError::Format(format!(
            "tensor '{}' has shape {:?}, expected {:?}",
            name, got, want
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::GaussianAccumulator;
    use crate::test_utils::embedding_from_vectors;
    use approx::assert_relative_eq;

    fn toy_model() -> GaussianModel {
        let mut acc = GaussianAccumulator::new(2, 1, 2);
        let batch = vec![
            embedding_from_vectors(1, 2, &[vec![1.0, 0.0], vec![0.0, 0.0]]),
            embedding_from_vectors(1, 2, &[vec![-1.0, 0.0], vec![0.0, 2.0]]),
            embedding_from_vectors(1, 2, &[vec![0.0, 1.0], vec![0.0, -2.0]]),
            embedding_from_vectors(1, 2, &[vec![0.0, -1.0], vec![0.0, 0.0]]),
        ];
        acc.push_batch(&batch).expect("push");
        acc.finalize(0.01, BackboneArch::Pooled, vec![3, 7])
            .expect("finalize")
    }

    #[test]
    fn mahalanobis_matches_closed_form() {
        let model = toy_model();
        // Location 0: mean 0, covariance diag(2/3, 2/3) + 0.01.
        let var = 2.0 / 3.0 + 0.01;
        let d = model.mahalanobis(0, &[1.0, 1.0]);
        assert_relative_eq!(d, (2.0f32 / var).sqrt(), epsilon = 1e-4);
        assert_relative_eq!(model.mahalanobis(0, &[0.0, 0.0]), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn distance_map_has_grid_shape() {
        let model = toy_model();
        let probe = embedding_from_vectors(1, 2, &[vec![0.0, 0.0], vec![0.0, 4.0]]);
        let map = model.distance_map(&probe).expect("distance");
        assert_eq!((map.width(), map.height()), (2, 1));
        assert!(map.get(1, 0) > map.get(0, 0));
        let wrong = embedding_from_vectors(2, 1, &[vec![0.0, 0.0], vec![0.0, 0.0]]);
        assert!(model.distance_map(&wrong).is_err());
    }

    #[test]
    fn save_load_preserves_model() {
        let model = toy_model();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.safetensors");
        model.save(&path).expect("save");
        let loaded = GaussianModel::load(&path).expect("load");
        assert_eq!(loaded.arch(), BackboneArch::Pooled);
        assert_eq!(loaded.channel_idx(), &[3, 7]);
        assert_eq!(loaded.grid(), [1, 2]);
        assert_eq!(loaded.n_samples(), 4);
        assert_eq!(loaded.mean, model.mean);
        assert_eq!(loaded.precision, model.precision);
        assert_relative_eq!(
            loaded.mahalanobis(1, &[0.5, 1.5]),
            model.mahalanobis(1, &[0.5, 1.5])
        );
    }

    #[test]
    fn load_rejects_foreign_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("other.safetensors");
        let data = f32_bytes(&[1.0, 2.0]);
        let view = TensorView::new(Dtype::F32, vec![2], &data).expect("view");
        let mut meta = HashMap::new();
        meta.insert("schema".to_string(), "something.else".to_string());
        safetensors::serialize_to_file(vec![("x", view)], &Some(meta), &path).expect("write");
        let err = GaussianModel::load(&path).expect_err("schema");
        assert!(err.to_string().contains("unsupported model schema"));
    }

    fn write_raw_model(path: &Path, idx_shape: Vec<usize>, idx: &[i64], dim: usize) {
        let idx_bytes: Vec<u8> = idx.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mean_bytes = f32_bytes(&vec![0.0; dim]);
        let precision_bytes = f32_bytes(&vec![0.0; dim * dim]);
        let tensors = vec![
            (
                "channel_idx",
                TensorView::new(Dtype::I64, idx_shape, &idx_bytes).expect("idx"),
            ),
            (
                "mean",
                TensorView::new(Dtype::F32, vec![1, dim], &mean_bytes).expect("mean"),
            ),
            (
                "precision",
                TensorView::new(Dtype::F32, vec![1, dim, dim], &precision_bytes)
                    .expect("precision"),
            ),
        ];
        let mut meta = HashMap::new();
        meta.insert("schema".to_string(), MODEL_SCHEMA_V1.to_string());
        meta.insert("arch".to_string(), "pooled".to_string());
        meta.insert("height".to_string(), "1".to_string());
        meta.insert("width".to_string(), "1".to_string());
        meta.insert("n_samples".to_string(), "4".to_string());
        meta.insert("regularization".to_string(), "0.01".to_string());
        safetensors::serialize_to_file(tensors, &Some(meta), path).expect("write");
    }

    #[test]
    fn load_rejects_model_without_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.safetensors");
        write_raw_model(&path, vec![0], &[], 0);
        let err = GaussianModel::load(&path).expect_err("zero channels");
        assert!(matches!(err, PadimError::Format(_)));
    }

    #[test]
    fn load_rejects_multi_dimensional_channel_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("idx2d.safetensors");
        write_raw_model(&path, vec![1, 2], &[0, 1], 2);
        let err = GaussianModel::load(&path).expect_err("2-D channel_idx");
        assert!(err.to_string().contains("channel_idx"));
    }
}
