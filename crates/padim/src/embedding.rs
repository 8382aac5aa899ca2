//! Patch embeddings: multi-layer concatenation and random channel reduction.
//!
//! Coarser layers are tiled onto the finest grid, so the embedding of grid
//! cell `(y, x)` is the concatenation over layers `k` of
//! `layer_k[:, y / s_k, x / s_k]` with `s_k = H_0 / H_k`.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{PadimError, PadimResult};
use crate::tensor::{FeaturePyramid, Tensor3};

/// Per-location feature vectors on the finest backbone grid.
///
/// Stored location-major: the vector of location `l = y * width + x` is
/// `data[l * dim..(l + 1) * dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    dim: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Embedding {
    /// Wrap a location-major buffer of `height * width` vectors of length `dim`.
    pub fn from_vec(dim: usize, height: usize, width: usize, data: Vec<f32>) -> PadimResult<Self> {
        if data.len() != dim * height * width {
            return Err(PadimError::ShapeMismatch {
                what: "embedding buffer",
                expected: vec![height, width, dim],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            dim,
            height,
            width,
            data,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of grid locations.
    pub fn locations(&self) -> usize {
        self.height * self.width
    }

    /// Feature vector at a flat location index.
    #[inline]
    pub fn vector(&self, loc: usize) -> &[f32] {
        &self.data[loc * self.dim..(loc + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Draw `reduced` distinct channel indices out of `total`, seeded.
///
/// Indices are returned sorted; the Mahalanobis distance does not depend on
/// channel order.
pub fn select_channels(total: usize, reduced: usize, seed: u64) -> PadimResult<Vec<usize>> {
    if reduced == 0 || reduced > total {
        return Err(PadimError::Config(format!(
            "cannot select {} channels out of {}",
            reduced, total
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut idx = rand::seq::index::sample(&mut rng, total, reduced).into_vec();
    idx.sort_unstable();
    Ok(idx)
}

/// Maps selected embedding channels back to `(layer, channel)` pairs.
#[derive(Debug, Clone)]
pub struct ChannelPlan {
    layer_channels: Vec<usize>,
    sources: Vec<(usize, usize)>,
}

impl ChannelPlan {
    /// Plan keeping `selected` global channel indices of a pyramid with the
    /// given per-layer channel counts.
    pub fn new(layer_channels: &[usize], selected: &[usize]) -> PadimResult<Self> {
        let total: usize = layer_channels.iter().sum();
        let mut sources = Vec::with_capacity(selected.len());
        for &g in selected {
            if g >= total {
                return Err(PadimError::Config(format!(
                    "channel index {} out of range for {} channels",
                    g, total
                )));
            }
            let mut offset = 0;
            for (layer, &n) in layer_channels.iter().enumerate() {
                if g < offset + n {
                    sources.push((layer, g - offset));
                    break;
                }
                offset += n;
            }
        }
        Ok(Self {
            layer_channels: layer_channels.to_vec(),
            sources,
        })
    }

    /// Plan keeping every channel.
    pub fn full(layer_channels: &[usize]) -> Self {
        let total: usize = layer_channels.iter().sum();
        let all: Vec<usize> = (0..total).collect();
        // Indices are in range by construction.
        Self::new(layer_channels, &all).unwrap_or(Self {
            layer_channels: layer_channels.to_vec(),
            sources: Vec::new(),
        })
    }

    pub fn dim(&self) -> usize {
        self.sources.len()
    }

    pub fn layer_channels(&self) -> &[usize] {
        &self.layer_channels
    }
}

/// Integer tiling factors of each layer relative to the finest one.
fn tile_factors(pyramid: &FeaturePyramid) -> PadimResult<Vec<(usize, usize)>> {
    let finest = pyramid
        .layers
        .first()
        .ok_or_else(|| PadimError::Backbone("feature pyramid has no layers".into()))?;
    let (h0, w0) = (finest.height(), finest.width());
    pyramid
        .layers
        .iter()
        .map(|layer| {
            let (h, w) = (layer.height(), layer.width());
            if h == 0 || w == 0 || h0 % h != 0 || w0 % w != 0 {
                return Err(PadimError::ShapeMismatch {
                    what: "feature layer grid",
                    expected: vec![h0, w0],
                    got: vec![h, w],
                });
            }
            Ok((h0 / h, w0 / w))
        })
        .collect()
}

/// Concatenate all layers along channels on the finest grid.
pub fn embedding_concat(pyramid: &FeaturePyramid) -> PadimResult<Tensor3> {
    let factors = tile_factors(pyramid)?;
    let (h0, w0) = (pyramid.layers[0].height(), pyramid.layers[0].width());
    let mut out = Tensor3::zeros(pyramid.total_channels(), h0, w0);
    let mut c_out = 0;
    for (layer, &(sy, sx)) in pyramid.layers.iter().zip(&factors) {
        for c in 0..layer.channels() {
            for y in 0..h0 {
                for x in 0..w0 {
                    out.set(c_out, y, x, layer.get(c, y / sy, x / sx));
                }
            }
            c_out += 1;
        }
    }
    Ok(out)
}

/// Build the reduced patch embedding of one image.
pub fn embed(pyramid: &FeaturePyramid, plan: &ChannelPlan) -> PadimResult<Embedding> {
    let got = pyramid.layer_channels();
    if got != plan.layer_channels {
        return Err(PadimError::ShapeMismatch {
            what: "feature pyramid channels",
            expected: plan.layer_channels.clone(),
            got,
        });
    }
    let factors = tile_factors(pyramid)?;
    let (h0, w0) = (pyramid.layers[0].height(), pyramid.layers[0].width());
    let dim = plan.dim();
    let mut data = vec![0.0f32; h0 * w0 * dim];
    for y in 0..h0 {
        for x in 0..w0 {
            let base = (y * w0 + x) * dim;
            for (k, &(layer, c)) in plan.sources.iter().enumerate() {
                let (sy, sx) = factors[layer];
                data[base + k] = pyramid.layers[layer].get(c, y / sy, x / sx);
            }
        }
    }
    Ok(Embedding {
        dim,
        height: h0,
        width: w0,
        data,
    })
}
