//! Single-plane f32 maps: distance grids, heat maps and ground-truth masks.

use image::{ImageBuffer, Luma};

use crate::error::{PadimError, PadimResult};

/// Row-major `height x width` f32 plane.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoreMap {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl ScoreMap {
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> PadimResult<Self> {
        if data.len() != width * height {
            return Err(PadimError::ShapeMismatch {
                what: "score map buffer",
                expected: vec![height, width],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: f32) {
        self.data[y * self.width + x] = v;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Largest value, or `None` for an empty map.
    pub fn max(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::max)
    }

    /// Smallest value, or `None` for an empty map.
    pub fn min(&self) -> Option<f32> {
        self.data.iter().copied().reduce(f32::min)
    }

    /// Apply `f` to every value.
    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        for v in &mut self.data {
            *v = f(*v);
        }
    }

    /// Convert into an `imageproc`-compatible f32 image.
    pub fn to_image(&self) -> ImageBuffer<Luma<f32>, Vec<f32>> {
        ImageBuffer::from_raw(self.width as u32, self.height as u32, self.data.clone())
            .unwrap_or_else(|| ImageBuffer::new(self.width as u32, self.height as u32))
    }

    /// Build from an f32 image.
    pub fn from_image(img: &ImageBuffer<Luma<f32>, Vec<f32>>) -> Self {
        let (w, h) = img.dimensions();
        Self {
            width: w as usize,
            height: h as usize,
            data: img.as_raw().clone(),
        }
    }
}
