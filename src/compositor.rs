use crate::errors::{Result, RmbgError};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Pixel, Primitive, Rgba, RgbaImage};
use num_traits::{AsPrimitive, Bounded};
use std::any::TypeId;

fn is_floating_point<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<f32>()
}

/// Full opacity for a subpixel type: 1.0 for floats, the type maximum otherwise.
pub fn get_max_value<T: Bounded + num_traits::NumCast + 'static>() -> T {
    if is_floating_point::<T>() {
        T::from(1.0).unwrap_or_else(T::max_value)
    } else {
        T::max_value()
    }
}

/// Replaces the alpha channel of an RGBA buffer with an 8-bit mask.
pub trait ReplaceAlpha: Sized {
    fn replace_alpha(self, mask: &GrayImage) -> Result<Self>;
}

impl<S> ReplaceAlpha for ImageBuffer<Rgba<S>, Vec<S>>
where
    Rgba<S>: Pixel<Subpixel = S>,
    S: Primitive + AsPrimitive<f32> + 'static,
    f32: AsPrimitive<S>,
{
    fn replace_alpha(mut self, mask: &GrayImage) -> Result<Self> {
        if self.dimensions() != mask.dimensions() {
            return Err(RmbgError::MaskDimensionMismatch {
                expected: self.dimensions(),
                actual: mask.dimensions(),
            });
        }

        let max: f32 = get_max_value::<S>().as_();
        let scale = max / <f32 as From<u8>>::from(u8::MAX);
        for (pixel, &Luma([alpha])) in self.pixels_mut().zip(mask.pixels()) {
            let alpha = <f32 as From<u8>>::from(alpha) * scale;
            pixel.0[3] = if is_floating_point::<S>() {
                alpha.as_()
            } else {
                alpha.round().as_()
            };
        }
        Ok(self)
    }
}

/// Cuts out the foreground of `original`: RGB is kept as is, the mask becomes
/// the alpha channel.
pub fn composite(original: &DynamicImage, mask: &GrayImage) -> Result<RgbaImage> {
    original.to_rgba8().replace_alpha(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba32FImage};

    fn gradient() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(6, 4, |x, y| {
            Rgb([x as u8 * 40, y as u8 * 60, 200])
        }))
    }

    #[test]
    fn test_opaque_mask_keeps_colors() -> Result<()> {
        let original = gradient();
        let mask = GrayImage::from_pixel(6, 4, Luma([255]));

        let output = composite(&original, &mask)?;
        let source = original.to_rgb8();
        for (out, src) in output.pixels().zip(source.pixels()) {
            assert_eq!(out.0[..3], src.0);
            assert_eq!(out.0[3], 255);
        }
        Ok(())
    }

    #[test]
    fn test_zero_mask_is_fully_transparent() -> Result<()> {
        let mask = GrayImage::from_pixel(6, 4, Luma([0]));
        let output = composite(&gradient(), &mask)?;
        assert!(output.pixels().all(|p| p.0[3] == 0));
        Ok(())
    }

    #[test]
    fn test_partial_alpha_is_copied_exactly() -> Result<()> {
        let mask = GrayImage::from_fn(6, 4, |x, y| Luma([(x * 4 + y) as u8 * 10]));
        let output = composite(&gradient(), &mask)?;
        for (out, m) in output.pixels().zip(mask.pixels()) {
            assert_eq!(out.0[3], m.0[0]);
        }
        Ok(())
    }

    #[test]
    fn test_float_buffers_use_unit_alpha() -> Result<()> {
        let image = Rgba32FImage::from_pixel(2, 2, Rgba([0.2, 0.4, 0.6, 0.0]));
        let mask = GrayImage::from_pixel(2, 2, Luma([255]));
        let output = image.replace_alpha(&mask)?;
        assert!(output.pixels().all(|p| (p.0[3] - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn test_sixteen_bit_alpha_is_rescaled() -> Result<()> {
        let image: ImageBuffer<Rgba<u16>, Vec<u16>> =
            ImageBuffer::from_pixel(3, 1, Rgba([1000, 2000, 3000, 0]));
        let mask = GrayImage::from_fn(3, 1, |x, _| Luma([[0, 128, 255][x as usize]]));
        let output = image.replace_alpha(&mask)?;
        let alphas: Vec<u16> = output.pixels().map(|p| p.0[3]).collect();
        assert_eq!(alphas, [0, 32896, u16::MAX]);
        assert!(output.pixels().all(|p| p.0[..3] == [1000, 2000, 3000]));
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch() {
        let mask = GrayImage::new(5, 4);
        assert!(matches!(
            composite(&gradient(), &mask),
            Err(RmbgError::MaskDimensionMismatch {
                expected: (6, 4),
                actual: (5, 4)
            })
        ));
    }
}
