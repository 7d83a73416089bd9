use crate::errors::Result;
use crate::export::ExportOptions;
use ndarray::prelude::*;
use std::path::Path;

/// Binary segmentation model seen as a black box.
///
/// Takes a normalized `[1, 3, H, W]` tensor and returns raw saliency scores of
/// shape `[1, 1, H, W]`. `(H, W)` is [`input_size`](Self::input_size) and never
/// changes for the lifetime of the model.
pub trait SegmentationModel: Send + Sync {
    /// Spatial size `(height, width)` the model expects.
    fn input_size(&self) -> (usize, usize);

    fn infer(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>>;
}

impl<M: SegmentationModel + ?Sized> SegmentationModel for &M {
    fn input_size(&self) -> (usize, usize) {
        (**self).input_size()
    }

    fn infer(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        (**self).infer(tensor)
    }
}

/// Serializes a model's computation graph to a portable file.
///
/// `sample` is fed through the model once; its shape fixes every axis not
/// listed as dynamic in `options`.
pub trait GraphExporter {
    fn export_graph(
        &self,
        sample: ArrayView4<f32>,
        options: &ExportOptions,
        destination: &Path,
    ) -> Result<()>;
}
