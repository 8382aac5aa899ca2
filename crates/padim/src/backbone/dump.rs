use std::path::{Path, PathBuf};

use safetensors::{Dtype, SafeTensors};

use super::{BackboneInput, FeatureExtractor};
use crate::error::{PadimError, PadimResult};
use crate::model::{expect_dtype, f32_values};
use crate::tensor::{FeaturePyramid, Tensor3};

/// Replays backbone activations exported ahead of time.
///
/// For an input read from `.../name.png` the extractor opens
/// `<dir>/name.safetensors` and reads tensors `layer1`, `layer2`, ... as F32
/// with shape `[C, H, W]` or `[1, C, H, W]`.
#[derive(Debug, Clone)]
pub struct FeatureDumpExtractor {
    dir: PathBuf,
    layer_channels: Vec<usize>,
}

impl FeatureDumpExtractor {
    pub fn new(dir: impl Into<PathBuf>, layer_channels: &[usize]) -> Self {
        Self {
            dir: dir.into(),
            layer_channels: layer_channels.to_vec(),
        }
    }

    /// Dump file for an image path.
    pub fn dump_path(&self, source: &Path) -> PadimResult<PathBuf> {
        let stem = source.file_stem().ok_or_else(|| {
            PadimError::Backbone(format!("no file stem in {}", source.display()))
        })?;
        let mut name = stem.to_os_string();
        name.push(".safetensors");
        Ok(self.dir.join(name))
    }

    fn read_pyramid(&self, source: &Path) -> PadimResult<FeaturePyramid> {
        let path = self.dump_path(source)?;
        let bytes = std::fs::read(&path).map_err(|e| {
            PadimError::Backbone(format!("cannot read feature dump {}: {}", path.display(), e))
        })?;
        let tensors = SafeTensors::deserialize(&bytes)?;

        let mut layers = Vec::with_capacity(self.layer_channels.len());
        for (k, &channels) in self.layer_channels.iter().enumerate() {
            let name = format!("layer{}", k + 1);
            let view = tensors.tensor(&name)?;
            expect_dtype(&name, view.dtype(), Dtype::F32)?;
            let (c, h, w) = match *view.shape() {
                [c, h, w] => (c, h, w),
                [1, c, h, w] => (c, h, w),
                ref other => {
                    return Err(PadimError::Format(format!(
                        "tensor '{}' in {} has shape {:?}, expected [C, H, W]",
                        name,
                        path.display(),
                        other
                    )))
                }
            };
            if c != channels {
                return Err(PadimError::ShapeMismatch {
                    what: "dumped layer channels",
                    expected: vec![channels],
                    got: vec![c],
                });
            }
            layers.push(Tensor3::from_vec(c, h, w, f32_values(view.data()))?);
        }
        Ok(FeaturePyramid::new(layers))
    }
}

impl FeatureExtractor for FeatureDumpExtractor {
    fn layer_channels(&self) -> Vec<usize> {
        self.layer_channels.clone()
    }

    fn extract(&mut self, batch: &[BackboneInput<'_>]) -> PadimResult<Vec<FeaturePyramid>> {
        batch
            .iter()
            .map(|input| {
                if input.geometry.is_some() {
                    return Err(PadimError::Backbone(
                        "feature dumps cannot be combined with augmentation".into(),
                    ));
                }
                self.read_pyramid(input.source)
            })
            .collect()
    }
}
