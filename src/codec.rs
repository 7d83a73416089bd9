//! Conversion between decoded images and the model's tensor contract.
//!
//! Resizing uses bilinear interpolation with half-pixel centers and no
//! antialiasing (`align_corners=False` in PyTorch terms), in both directions,
//! so masks line up with the source image at the borders.

use crate::config::DegeneratePolicy;
use crate::errors::{Result, RmbgError};
use image::{DynamicImage, GenericImageView, GrayImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use rayon::prelude::*;

/// Per-channel normalization applied after scaling pixels to `[0, 1]`.
pub const MEAN: [f32; 3] = [0.5, 0.5, 0.5];
pub const STD: [f32; 3] = [1.0, 1.0, 1.0];

/// Source neighbours and weight of the upper neighbour for one output index.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tap {
    lo: usize,
    hi: usize,
    weight: f32,
}

fn taps(input: usize, output: usize) -> Vec<Tap> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|dst| {
            let src = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
            let lo = (src as usize).min(input - 1);
            let hi = if lo < input - 1 { lo + 1 } else { lo };
            Tap {
                lo,
                hi,
                weight: src - lo as f32,
            }
        })
        .collect()
}

/// Resizes every plane of a `(channels, height, width)` array to `size`.
pub fn resize_bilinear(input: ArrayView3<f32>, size: (usize, usize)) -> Result<Array3<f32>> {
    let (channels, in_height, in_width) = input.dim();
    let (height, width) = size;
    if height == 0 || width == 0 || in_height == 0 || in_width == 0 {
        return Err(RmbgError::invalid_tensor(format!(
            "cannot resize {in_height}x{in_width} to {height}x{width}"
        )));
    }

    let rows = taps(in_height, height);
    let cols = taps(in_width, width);

    let mut data = vec![0.0f32; channels * height * width];
    data.par_chunks_mut(width)
        .enumerate()
        .for_each(|(index, out)| {
            let plane = input.index_axis(Axis(0), index / height);
            let row = rows[index % height];
            let (h0, h1) = (1.0 - row.weight, row.weight);
            for (value, col) in out.iter_mut().zip(&cols) {
                let (w0, w1) = (1.0 - col.weight, col.weight);
                *value = h0 * (w0 * plane[[row.lo, col.lo]] + w1 * plane[[row.lo, col.hi]])
                    + h1 * (w0 * plane[[row.hi, col.lo]] + w1 * plane[[row.hi, col.hi]]);
            }
        });

    Ok(Array3::from_shape_vec((channels, height, width), data)?)
}

/// Builds the model input from raw pixels laid out as `(height, width)` or
/// `(height, width, channels)`.
///
/// A missing channel axis is added, a single channel is repeated to RGB and
/// a fourth (alpha) channel is dropped. The result has shape
/// `[1, 3, target_size.0, target_size.1]`.
pub fn encode(pixels: ArrayViewD<u8>, target_size: (usize, usize)) -> Result<Array4<f32>> {
    let pixels = match pixels.ndim() {
        2 => pixels.insert_axis(Axis(2)),
        3 => pixels,
        n => {
            return Err(RmbgError::invalid_tensor(format!(
                "expected a 2 or 3 dimensional image, got {n} dimensions"
            )))
        }
    };
    let pixels = pixels.into_dimensionality::<Ix3>()?;
    encode_planes(pixels.permuted_axes([2, 0, 1]), target_size)
}

/// Same as [`encode`] for a decoded image of any color type.
pub fn encode_image(image: &DynamicImage, target_size: (usize, usize)) -> Result<Array4<f32>> {
    let rgb = image.to_rgb8();
    encode_planes(rgb.as_ndarray3(), target_size)
}

fn encode_planes(planes: ArrayView3<u8>, target_size: (usize, usize)) -> Result<Array4<f32>> {
    let (channels, height, width) = planes.dim();
    let rgb = match channels {
        1 => planes
            .broadcast((3, height, width))
            .ok_or_else(|| RmbgError::invalid_tensor("cannot expand a single channel to RGB"))?,
        3 | 4 => planes.slice(s![..3, .., ..]),
        n => {
            return Err(RmbgError::invalid_tensor(format!(
                "expected 1, 3 or 4 channels, got {n}"
            )))
        }
    };

    let mut tensor = resize_bilinear(rgb.mapv(f32::from).view(), target_size)?;
    for (mut plane, (mean, std)) in tensor.outer_iter_mut().zip(MEAN.iter().zip(&STD)) {
        plane.mapv_inplace(|v| (v / 255.0 - mean) / std);
    }

    Ok(tensor.insert_axis(Axis(0)))
}

/// Turns raw `[1, 1, h, w]` model scores into an opacity mask of
/// `original_size` (`(height, width)`).
///
/// Scores are min-max normalized over the whole resized map. When every score
/// is equal the mask is filled according to `policy`.
pub fn decode(
    raw: ArrayView4<f32>,
    original_size: (usize, usize),
    policy: DegeneratePolicy,
) -> Result<GrayImage> {
    let (batch, channels, _, _) = raw.dim();
    if batch != 1 || channels != 1 {
        return Err(RmbgError::invalid_tensor(format!(
            "expected model output of shape [1, 1, h, w], got {:?}",
            raw.shape()
        )));
    }

    let resized = resize_bilinear(raw.index_axis(Axis(0), 0), original_size)?;

    let (min, max) = resized
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;

    let (height, width) = original_size;
    let pixels = if range > 0.0 && range.is_finite() {
        resized
            .iter()
            .map(|&v| ((v - min) / range * 255.0) as u8)
            .collect()
    } else {
        let fill = match policy {
            DegeneratePolicy::Opaque => u8::MAX,
            DegeneratePolicy::Transparent => u8::MIN,
            DegeneratePolicy::Fail => return Err(RmbgError::DegenerateOutputRange { min, max }),
        };
        vec![fill; height * width]
    };

    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| RmbgError::invalid_tensor("mask buffer does not match its dimensions"))
}

/// `(height, width)` of an image, the order the codec uses everywhere.
pub fn image_size(image: &DynamicImage) -> (usize, usize) {
    let (width, height) = image.dimensions();
    (height as usize, width as usize)
}
