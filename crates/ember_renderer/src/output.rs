//! Image output for offline renders.

use std::path::Path;

use ember_math::Vec4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Pixel buffer holds {actual} pixels, expected {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
}

/// Apply gamma correction (gamma = 2.0).
#[inline]
pub fn linear_to_gamma(linear: f32) -> f32 {
    if linear > 0.0 {
        linear.sqrt()
    } else {
        0.0
    }
}

/// Gamma-corrected 8-bit RGBA with opaque alpha.
pub fn to_rgba8(color: Vec4) -> [u8; 4] {
    let channel = |c: f32| (255.0 * linear_to_gamma(c).clamp(0.0, 1.0)) as u8;
    [channel(color.x), channel(color.y), channel(color.z), 255]
}

/// Write a linear radiance image as a PNG.
pub fn save_png<P: AsRef<Path>>(path: P, width: u32, height: u32, pixels: &[Vec4]) -> Result<(), OutputError> {
    let expected = width as usize * height as usize;
    if pixels.len() != expected {
        return Err(OutputError::SizeMismatch {
            expected,
            actual: pixels.len(),
        });
    }

    let bytes: Vec<u8> = pixels.iter().flat_map(|&p| to_rgba8(p)).collect();
    image::save_buffer(path.as_ref(), &bytes, width, height, image::ColorType::Rgba8)?;
    log::info!("Wrote {}x{} image to {}", width, height, path.as_ref().display());
    Ok(())
}
