//! Cropping host screenshots to an element's bounding box.

use super::types::ScreenshotRect;
use crate::error::ScreenshotError;
use image::ImageFormat;
use std::io::Cursor;

/// Crop `capture` to `rect` scaled by `device_pixel_ratio` and encode as PNG.
///
/// The rectangle is clamped to the image. Returns `None` when nothing of it
/// lies inside the capture.
pub fn crop_screenshot(
    capture: &[u8],
    rect: ScreenshotRect,
    device_pixel_ratio: f64,
) -> Result<Option<Vec<u8>>, ScreenshotError> {
    let image = image::load_from_memory(capture)?;
    let (img_w, img_h) = (image.width(), image.height());
    let scale = |v: f64| -> u32 {
        let scaled = (v * device_pixel_ratio).round();
        if scaled.is_finite() && scaled > 0.0 {
            scaled.min(u32::MAX as f64) as u32
        } else {
            0
        }
    };

    let x = scale(rect.x).min(img_w);
    let y = scale(rect.y).min(img_h);
    let width = scale(rect.width).min(img_w - x);
    let height = scale(rect.height).min(img_h - y);
    if width == 0 || height == 0 {
        return Ok(None);
    }

    let cropped = image.crop_imm(x, y, width, height);
    let mut out = Cursor::new(Vec::new());
    cropped.write_to(&mut out, ImageFormat::Png)?;
    Ok(Some(out.into_inner()))
}
