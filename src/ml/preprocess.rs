//! Image preprocessing shared by training and inference
//!
//! decode -> RGB -> 224x224 stretch -> channel-last floats in [0, 1]

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use thiserror::Error;

use crate::ml::ml_model::{CHANNELS, IMAGE_SIZE};

/// Resampling filter used for every resize
const RESIZE_FILTER: FilterType = FilterType::CatmullRom;

/// Values per preprocessed image
pub const PIXELS_PER_IMAGE: usize = IMAGE_SIZE * IMAGE_SIZE * CHANNELS;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("cannot identify image file: {0}")]
    Decode(#[from] image::ImageError),
}

/// Converts to 3-channel RGB and stretches to the model input size
pub fn to_model_rgb(image: &DynamicImage) -> RgbImage {
    let rgb = image.to_rgb8();
    let size = IMAGE_SIZE as u32;
    if rgb.dimensions() == (size, size) {
        return rgb;
    }
    image::imageops::resize(&rgb, size, size, RESIZE_FILTER)
}

/// Row-major channel-last values divided by 255
pub fn normalize(image: &RgbImage) -> Vec<f32> {
    image.as_raw().iter().map(|&v| v as f32 / 255.0).collect()
}

/// Decodes an uploaded image into normalized pixels
pub fn preprocess_bytes(bytes: &[u8]) -> Result<Vec<f32>, PreprocessError> {
    let image = image::load_from_memory(bytes)?;
    Ok(normalize(&to_model_rgb(&image)))
}

/// Loads an image file resized to the model input size (not yet normalized)
pub fn load_model_rgb(path: &Path) -> Result<RgbImage, PreprocessError> {
    let image = image::open(path)?;
    Ok(to_model_rgb(&image))
}

/// Builds a [batch, 224, 224, 3] tensor from concatenated normalized images
pub fn to_tensor<B: Backend>(pixels: &[f32], batch_size: usize, device: &B::Device) -> Tensor<B, 4> {
    Tensor::<B, 1>::from_floats(pixels, device).reshape([batch_size, IMAGE_SIZE, IMAGE_SIZE, CHANNELS])
}

/// Decodes an uploaded image into a [1, 224, 224, 3] tensor
pub fn preprocess_to_tensor<B: Backend>(
    bytes: &[u8],
    device: &B::Device,
) -> Result<Tensor<B, 4>, PreprocessError> {
    let pixels = preprocess_bytes(bytes)?;
    Ok(to_tensor(&pixels, 1, device))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    type TestBackend = NdArray<f32>;

    /// Encodes a synthetic gradient image
    pub(crate) fn encoded_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128, 200])
        });
        let image = match format {
            ImageFormat::Jpeg => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image).to_rgb8()),
            _ => DynamicImage::ImageRgba8(image),
        };
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    #[test]
    fn test_shape_and_range() {
        let device = Default::default();
        for (w, h, format) in [
            (640, 480, ImageFormat::Jpeg),
            (31, 500, ImageFormat::Png),
            (224, 224, ImageFormat::Png),
            (3, 3, ImageFormat::Bmp),
        ] {
            let tensor =
                preprocess_to_tensor::<TestBackend>(&encoded_image(w, h, format), &device).unwrap();
            assert_eq!(tensor.dims(), [1, 224, 224, 3]);

            let values = tensor.into_data().to_vec::<f32>().unwrap();
            assert_eq!(values.len(), PIXELS_PER_IMAGE);
            assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_grayscale_becomes_three_channels() {
        let gray = image::GrayImage::from_pixel(50, 40, image::Luma([255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let pixels = preprocess_bytes(&bytes).unwrap();
        assert_eq!(pixels.len(), PIXELS_PER_IMAGE);
        assert!(pixels.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_alpha_is_discarded() {
        let bytes = encoded_image(10, 10, ImageFormat::Png);
        let pixels = preprocess_bytes(&bytes).unwrap();
        // blue channel was 128 everywhere before resizing
        assert!((pixels[2] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_deterministic() {
        let bytes = encoded_image(300, 200, ImageFormat::Jpeg);
        assert_eq!(preprocess_bytes(&bytes).unwrap(), preprocess_bytes(&bytes).unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let result = preprocess_bytes(b"definitely not an image");
        assert!(matches!(result, Err(PreprocessError::Decode(_))));
    }
}
