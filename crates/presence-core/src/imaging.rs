//! Pixel-buffer helpers shared by the quality gate, detectors and recognizer.

use crate::types::FaceRegion;
use image::{GrayImage, Luma, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("image payload is empty")]
    Empty,
    #[error("not a valid image: {0}")]
    Invalid(#[from] image::ImageError),
    #[error("image has zero width or height")]
    ZeroSized,
}

/// Decode an uploaded payload (JPEG, PNG, ...) into an RGB buffer.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(DecodeError::ZeroSized);
    }
    Ok(rgb)
}

/// Convert to 8-bit luma with BT.601 weights (0.299 R + 0.587 G + 0.114 B).
pub fn grayscale(image: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        gray.put_pixel(x, y, Luma([luma.round().clamp(0.0, 255.0) as u8]));
    }
    gray
}

/// Crop `region` grown by `margin` (fraction of the region's width/height) on
/// every side, clamped to the image.
///
/// Returns the crop and the expanded region it was taken from.
pub fn crop_with_margin(image: &RgbImage, region: &FaceRegion, margin: f32) -> (RgbImage, FaceRegion) {
    let margin = margin.max(0.0);
    let margin_x = (region.width() as f32 * margin) as u32;
    let margin_y = (region.height() as f32 * margin) as u32;

    let expanded = FaceRegion {
        x1: region.x1.saturating_sub(margin_x),
        y1: region.y1.saturating_sub(margin_y),
        x2: region.x2.saturating_add(margin_x).min(image.width()),
        y2: region.y2.saturating_add(margin_y).min(image.height()),
    };

    let crop = image::imageops::crop_imm(
        image,
        expanded.x1,
        expanded.y1,
        expanded.width(),
        expanded.height(),
    )
    .to_image();

    (crop, expanded)
}
