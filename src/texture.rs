//! Pixel buffers shared by the bake and generation paths.
//!
//! Every image the pipeline touches is a Bevy [`Image`] holding RGBA8 sRGB
//! texels, row-major, single mip level.  The helpers here validate sizes,
//! encode linear colours, and write finished images to disk as PNG.

use std::{path::Path, sync::OnceLock};

use bevy::{
    asset::RenderAssetUsages,
    color::LinearRgba,
    image::Image,
    render::render_resource::{Extent3d, TextureDimension, TextureFormat},
};
use thiserror::Error;

use crate::error::PipelineError;

/// Error returned when image dimensions or buffers are invalid.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TextureError {
    /// Either `width` or `height` was zero, which is not a valid wgpu texture size.
    #[error("texture dimensions must be non-zero (got {width}×{height})")]
    ZeroDimension { width: u32, height: u32 },
    /// One or both dimensions exceeded [`MAX_DIMENSION`].
    #[error("texture dimensions {width}×{height} exceed MAX_DIMENSION={max}")]
    DimensionTooLarge { width: u32, height: u32, max: u32 },
    /// The pixel buffer length does not match `width * height * 4`.
    #[error("pixel buffer holds {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

/// Maximum allowed texture dimension (per side).
pub const MAX_DIMENSION: u32 = 4096;

/// Texel format of every baked or generated image.
pub const TEXEL_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

/// RGBA8 pixels handed over by an image generator, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureMap {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl TextureMap {
    /// Wraps a pixel buffer after checking it matches the dimensions.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self, TextureError> {
        validate_dimensions(width, height)?;
        check_len(&pixels, width, height)?;
        Ok(Self {
            pixels,
            width,
            height,
        })
    }
}

/// Dimension guard for every image the pipeline allocates.
#[inline]
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), TextureError> {
    if width == 0 || height == 0 {
        return Err(TextureError::ZeroDimension { width, height });
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(TextureError::DimensionTooLarge {
            width,
            height,
            max: MAX_DIMENSION,
        });
    }
    Ok(())
}

fn check_len(pixels: &[u8], width: u32, height: u32) -> Result<(), TextureError> {
    let expected = width as usize * height as usize * 4;
    if pixels.len() != expected {
        return Err(TextureError::BufferSize {
            expected,
            actual: pixels.len(),
        });
    }
    Ok(())
}

/// Allocates an opaque black image, the host's default for new images.
pub fn blank_image(width: u32, height: u32) -> Result<Image, TextureError> {
    validate_dimensions(width, height)?;
    let texels = width as usize * height as usize;
    let pixels = [0u8, 0, 0, 255].repeat(texels);
    image_from_pixels(pixels, width, height)
}

/// Moves an RGBA8 buffer into a new [`Image`].
pub fn image_from_pixels(pixels: Vec<u8>, width: u32, height: u32) -> Result<Image, TextureError> {
    validate_dimensions(width, height)?;
    check_len(&pixels, width, height)?;
    Ok(Image::new(
        Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        TextureDimension::D2,
        pixels,
        TEXEL_FORMAT,
        RenderAssetUsages::default(),
    ))
}

/// `(width, height)` of an image in texels.
#[inline]
pub fn image_size(image: &Image) -> (u32, u32) {
    let size = image.texture_descriptor.size;
    (size.width, size.height)
}

/// Base-level texels of `image`; empty when the image holds no CPU data.
#[inline]
pub fn pixels(image: &Image) -> &[u8] {
    image.data.as_deref().unwrap_or(&[])
}

/// Mutable base-level texels of `image`, if it holds CPU data.
#[inline]
pub fn pixels_mut(image: &mut Image) -> Option<&mut [u8]> {
    image.data.as_deref_mut()
}

/// Encodes a linear colour as sRGB RGBA8; alpha stays linear.
pub fn encode_color(color: LinearRgba) -> [u8; 4] {
    [
        linear_to_srgb(color.red),
        linear_to_srgb(color.green),
        linear_to_srgb(color.blue),
        (color.alpha.clamp(0.0, 1.0) * 255.0).round() as u8,
    ]
}

/// Writes `image` to `path` as an 8-bit RGBA PNG.
pub fn save_png(image: &Image, path: &Path) -> Result<(), PipelineError> {
    let (width, height) = image_size(image);
    let data = pixels(image);
    check_len(data, width, height)?;
    let buffer = image::RgbaImage::from_raw(width, height, data.to_vec()).ok_or(
        TextureError::BufferSize {
            expected: width as usize * height as usize * 4,
            actual: data.len(),
        },
    )?;
    buffer.save_with_format(path, image::ImageFormat::Png)?;
    Ok(())
}

/// Decode an sRGB u8 value to linear-light f32.
pub fn srgb_to_linear(v: u8) -> f32 {
    static LUT: OnceLock<[f32; 256]> = OnceLock::new();
    LUT.get_or_init(|| {
        std::array::from_fn(|i| {
            let c = i as f32 / 255.0;
            if c <= 0.04045 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        })
    })[v as usize]
}

/// Convert a linear-light `f32` in `[0, 1]` to an sRGB-encoded `u8`.
///
/// Uses a 4096-entry lookup table built once; 256 bins would leave sRGB
/// values 1–12 unreachable because the curve is steep near zero.
#[inline]
pub fn linear_to_srgb(linear: f32) -> u8 {
    const N: usize = 4096;
    static LUT: OnceLock<[u8; N]> = OnceLock::new();
    let lut = LUT.get_or_init(|| {
        std::array::from_fn(|i| {
            let c = i as f32 / (N - 1) as f32;
            let encoded = if c <= 0.003_130_8 {
                c * 12.92
            } else {
                1.055 * c.powf(1.0 / 2.4) - 0.055
            };
            (encoded * 255.0).round() as u8
        })
    });
    lut[(linear.clamp(0.0, 1.0) * (N - 1) as f32).round() as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_oversized_dimensions() {
        assert_eq!(
            validate_dimensions(0, 4),
            Err(TextureError::ZeroDimension {
                width: 0,
                height: 4
            })
        );
        assert!(matches!(
            validate_dimensions(MAX_DIMENSION + 1, 1),
            Err(TextureError::DimensionTooLarge { .. })
        ));
        assert!(validate_dimensions(512, 512).is_ok());
    }

    #[test]
    fn blank_image_is_opaque_black() {
        let image = blank_image(4, 2).unwrap();
        assert_eq!(image_size(&image), (4, 2));
        let data = pixels(&image);
        assert_eq!(data.len(), 4 * 2 * 4);
        assert!(data.chunks_exact(4).all(|p| p == [0, 0, 0, 255]));
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let err = image_from_pixels(vec![0; 7], 1, 2).unwrap_err();
        assert_eq!(
            err,
            TextureError::BufferSize {
                expected: 8,
                actual: 7
            }
        );
    }

    #[test]
    fn srgb_round_trip_is_stable_at_endpoints() {
        assert_eq!(linear_to_srgb(0.0), 0);
        assert_eq!(linear_to_srgb(1.0), 255);
        assert_eq!(linear_to_srgb(srgb_to_linear(128)), 128);
    }

    #[test]
    fn encode_color_keeps_alpha_linear() {
        let encoded = encode_color(LinearRgba::new(1.0, 0.0, 0.0, 0.5));
        assert_eq!(encoded, [255, 0, 0, 128]);
    }

    #[test]
    fn png_lands_on_disk() {
        let dir = std::env::temp_dir().join(format!("island-bake-png-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("probe.png");
        save_png(&blank_image(8, 8).unwrap(), &path).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (8, 8));
        std::fs::remove_dir_all(&dir).ok();
    }
}
