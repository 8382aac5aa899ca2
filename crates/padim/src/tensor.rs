//! Dense channel-major tensors shared by backbone inputs and feature maps.

use crate::error::{PadimError, PadimResult};

/// Dense `C x H x W` f32 tensor stored channel-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor3 {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl Tensor3 {
    /// Zero-filled tensor.
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![0.0; channels * height * width],
        }
    }

    /// Wrap an existing buffer, checking that its length matches the shape.
    pub fn from_vec(
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f32>,
    ) -> PadimResult<Self> {
        let expected = channels * height * width;
        if data.len() != expected {
            return Err(PadimError::ShapeMismatch {
                what: "tensor buffer",
                expected: vec![expected],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// `[C, H, W]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.channels, self.height, self.width]
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, v: f32) {
        self.data[(c * self.height + y) * self.width + x] = v;
    }

    /// One `H x W` plane.
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.height * self.width;
        &self.data[c * plane..(c + 1) * plane]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// Multi-layer backbone output for a single image, finest layer first.
#[derive(Debug, Clone)]
pub struct FeaturePyramid {
    pub layers: Vec<Tensor3>,
}

impl FeaturePyramid {
    pub fn new(layers: Vec<Tensor3>) -> Self {
        Self { layers }
    }

    /// Channel count per layer.
    pub fn layer_channels(&self) -> Vec<usize> {
        self.layers.iter().map(Tensor3::channels).collect()
    }

    /// Sum of channels over all layers.
    pub fn total_channels(&self) -> usize {
        self.layers.iter().map(Tensor3::channels).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Tensor3::from_vec(2, 3, 4, vec![0.0; 23]).expect_err("short buffer");
        assert!(matches!(err, PadimError::ShapeMismatch { .. }));
    }

    #[test]
    fn indexing_is_channel_major() {
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let t = Tensor3::from_vec(2, 3, 4, data).expect("valid");
        assert_eq!(t.get(0, 0, 0), 0.0);
        assert_eq!(t.get(0, 1, 2), 6.0);
        assert_eq!(t.get(1, 0, 0), 12.0);
        assert_eq!(t.channel(1)[11], 23.0);
    }
}
