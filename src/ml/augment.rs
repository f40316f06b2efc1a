//! Random geometric augmentation for training images
//!
//! Rotation, shift and horizontal flip on an already resized image. Pixels
//! that fall outside the source are filled with the nearest edge pixel.

use image::{Rgb, RgbImage};
use rand::Rng;

use crate::model::AugmentationSettings;

/// Ranges the random transform is drawn from
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentConfig {
    /// Degrees, drawn from [-range, range]
    pub rotation_range: f32,
    /// Fraction of the width, drawn from [-range, range]
    pub width_shift_range: f32,
    /// Fraction of the height, drawn from [-range, range]
    pub height_shift_range: f32,
    pub horizontal_flip: bool,
}

impl From<&AugmentationSettings> for AugmentConfig {
    fn from(settings: &AugmentationSettings) -> Self {
        Self {
            rotation_range: settings.rotation_range.abs(),
            width_shift_range: settings.width_shift_range.abs(),
            height_shift_range: settings.height_shift_range.abs(),
            horizontal_flip: settings.horizontal_flip,
        }
    }
}

impl AugmentConfig {
    /// Draws one transform for a `width` x `height` image
    pub fn sample<R: Rng>(&self, rng: &mut R, width: u32, height: u32) -> Transform {
        Transform {
            rotation_degrees: symmetric(rng, self.rotation_range),
            shift_x: symmetric(rng, self.width_shift_range) * width as f32,
            shift_y: symmetric(rng, self.height_shift_range) * height as f32,
            flip: self.horizontal_flip && rng.gen_bool(0.5),
        }
    }
}

fn symmetric<R: Rng>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}

/// One concrete augmentation
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Transform {
    /// Counter-clockwise rotation around the image center
    pub rotation_degrees: f32,
    /// Positive values move the content right (pixels)
    pub shift_x: f32,
    /// Positive values move the content down (pixels)
    pub shift_y: f32,
    /// Mirror left-right after rotating and shifting
    pub flip: bool,
}

impl Transform {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;
        let (sin, cos) = self.rotation_degrees.to_radians().sin_cos();

        RgbImage::from_fn(width, height, |x, y| {
            let x = if self.flip { width - 1 - x } else { x };
            // Inverse mapping: output pixel -> source coordinate
            let dx = x as f32 - self.shift_x - cx;
            let dy = y as f32 - self.shift_y - cy;
            let sx = cx + cos * dx + sin * dy;
            let sy = cy - sin * dx + cos * dy;
            sample_bilinear(image, sx, sy)
        })
    }
}

/// Bilinear sample with coordinates clamped to the image (nearest fill)
fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = image.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        *value = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
