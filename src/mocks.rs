//! Deterministic stand-ins for the segmentation model, used by tests.

use crate::errors::{Result, RmbgError};
use crate::traits::SegmentationModel;
use ndarray::prelude::*;

/// Returns the luminance of its input as the saliency map.
#[derive(Debug, Clone)]
pub struct LuminanceModel {
    pub image_size: usize,
}

impl LuminanceModel {
    pub const fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl SegmentationModel for LuminanceModel {
    fn input_size(&self) -> (usize, usize) {
        (self.image_size, self.image_size)
    }

    fn infer(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, channels, height, width) = tensor.dim();
        if channels != 3 {
            return Err(RmbgError::InferenceFailure {
                reason: format!("expected 3 channels, got {channels}"),
            });
        }
        Ok(Array4::from_shape_fn((batch, 1, height, width), |(n, _, y, x)| {
            0.299 * tensor[[n, 0, y, x]] + 0.587 * tensor[[n, 1, y, x]] + 0.114 * tensor[[n, 2, y, x]]
        }))
    }
}

/// Returns the same score for every pixel.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    pub image_size: usize,
    pub value: f32,
}

impl ConstantModel {
    pub const fn new(image_size: usize, value: f32) -> Self {
        Self { image_size, value }
    }
}

impl SegmentationModel for ConstantModel {
    fn input_size(&self) -> (usize, usize) {
        (self.image_size, self.image_size)
    }

    fn infer(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let (batch, _, height, width) = tensor.dim();
        Ok(Array4::from_elem((batch, 1, height, width), self.value))
    }
}

/// Fails every inference.
#[derive(Debug, Clone)]
pub struct FailingModel {
    pub image_size: usize,
}

impl FailingModel {
    pub const fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl SegmentationModel for FailingModel {
    fn input_size(&self) -> (usize, usize) {
        (self.image_size, self.image_size)
    }

    fn infer(&self, _tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        Err(RmbgError::InferenceFailure {
            reason: "mock model always fails".to_string(),
        })
    }
}
