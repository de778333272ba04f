//! Frame enhancement stage.
//!
//! Frames are shrunk to fit a bounding box, then brightness, contrast and
//! sharpness are adjusted multiplicatively (in that order) and an optional
//! 3x3 median filter removes sensor noise. Each factor blends the frame with a
//! degenerate version of itself: black for brightness, the mean grey level for
//! contrast and a smoothed copy for sharpness. A factor of 1.0 leaves the
//! frame untouched and values above 1.0 extrapolate away from the degenerate
//! image.

use crate::config::ProcessingConfig;
use crate::processor::ProcessingError;
use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Pixel};
use imageproc::filter::median_filter;
use tracing::{trace, warn};

/// 3x3 smoothing weights used as the degenerate image for sharpness.
const SMOOTH_KERNEL: [u32; 9] = [1, 1, 1, 1, 5, 1, 1, 1, 1];

/// Enhancement parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhanceParams {
    pub max_width: u32,
    pub max_height: u32,
    pub brightness: f32,
    pub contrast: f32,
    pub sharpness: f32,
    pub denoise: bool,
}

impl Default for EnhanceParams {
    fn default() -> Self {
        Self::from(&ProcessingConfig::default())
    }
}

impl From<&ProcessingConfig> for EnhanceParams {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            max_width: config.resize_width,
            max_height: config.resize_height,
            brightness: config.brightness,
            contrast: config.contrast,
            sharpness: config.sharpness,
            denoise: config.denoise,
        }
    }
}

impl EnhanceParams {
    fn validate(&self) -> Result<(), ProcessingError> {
        if self.max_width == 0 || self.max_height == 0 {
            return Err(ProcessingError::InvalidParameter {
                name: "resize target",
                value: format!("{}x{}", self.max_width, self.max_height),
            });
        }

        for (name, factor) in [
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("sharpness", self.sharpness),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(ProcessingError::InvalidParameter {
                    name,
                    value: factor.to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Enhance a frame, falling back to an unchanged copy of the input when any
/// step fails.
pub fn enhance(image: &DynamicImage, params: &EnhanceParams) -> DynamicImage {
    match try_enhance(image, params) {
        Ok(enhanced) => enhanced,
        Err(e) => {
            warn!(error = %e, "Frame enhancement failed, using original frame");
            image.clone()
        }
    }
}

/// Enhance a frame, reporting failures to the caller.
pub fn try_enhance(
    image: &DynamicImage,
    params: &EnhanceParams,
) -> Result<DynamicImage, ProcessingError> {
    params.validate()?;

    if image.width() == 0 || image.height() == 0 {
        return Err(ProcessingError::EmptyFrame);
    }

    let resized = fit_within(image, params.max_width, params.max_height);
    trace!(
        original = format!("{}x{}", image.width(), image.height()),
        resized = format!("{}x{}", resized.width(), resized.height()),
        "Frame resized for enhancement"
    );

    let enhanced = match resized {
        DynamicImage::ImageLuma8(gray) => DynamicImage::ImageLuma8(adjust(gray, params)),
        other => DynamicImage::ImageRgb8(adjust(other.into_rgb8(), params)),
    };

    Ok(enhanced)
}

/// Shrink to fit the bounding box, preserving the aspect ratio. Frames that
/// already fit are never upscaled.
fn fit_within(image: &DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    if image.width() <= max_width && image.height() <= max_height {
        return image.clone();
    }
    image.resize(max_width, max_height, FilterType::Lanczos3)
}

fn adjust<P>(mut image: ImageBuffer<P, Vec<u8>>, params: &EnhanceParams) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    if params.brightness != 1.0 {
        adjust_brightness(&mut image, params.brightness);
    }
    if params.contrast != 1.0 {
        adjust_contrast(&mut image, params.contrast);
    }
    if params.sharpness != 1.0 {
        image = adjust_sharpness(&image, params.sharpness);
    }
    if params.denoise {
        image = median_filter(&image, 1, 1);
    }
    image
}

fn adjust_brightness<P>(image: &mut ImageBuffer<P, Vec<u8>>, factor: f32)
where
    P: Pixel<Subpixel = u8>,
{
    for value in image.iter_mut() {
        *value = clamp_u8(*value as f32 * factor);
    }
}

fn adjust_contrast<P>(image: &mut ImageBuffer<P, Vec<u8>>, factor: f32)
where
    P: Pixel<Subpixel = u8>,
{
    let mean = (mean_luma::<P>(image) + 0.5).floor();
    for value in image.iter_mut() {
        *value = clamp_u8(mean + (*value as f32 - mean) * factor);
    }
}

fn adjust_sharpness<P>(image: &ImageBuffer<P, Vec<u8>>, factor: f32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let mut smoothed = smooth3x3(image);
    for (out, original) in smoothed.iter_mut().zip(image.iter()) {
        let degenerate = *out as f32;
        *out = clamp_u8(degenerate + (*original as f32 - degenerate) * factor);
    }
    smoothed
}

/// Weighted 3x3 smoothing of interior pixels. The 1-pixel border is copied
/// from the source unchanged.
fn smooth3x3<P>(image: &ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = (image.width() as usize, image.height() as usize);
    let channels = P::CHANNEL_COUNT as usize;
    let weight_sum: u32 = SMOOTH_KERNEL.iter().sum();
    let src = image.as_raw();

    let mut out = image.clone();
    let dst: &mut [u8] = &mut out;

    for y in 1..height.saturating_sub(1) {
        for x in 1..width.saturating_sub(1) {
            for c in 0..channels {
                let mut acc = 0u32;
                for (tap, weight) in SMOOTH_KERNEL.iter().enumerate() {
                    let sx = x + tap % 3 - 1;
                    let sy = y + tap / 3 - 1;
                    acc += weight * src[(sy * width + sx) * channels + c] as u32;
                }
                let idx = (y * width + x) * channels + c;
                dst[idx] = ((acc + weight_sum / 2) / weight_sum) as u8;
            }
        }
    }

    out
}

/// Mean ITU-R 601-2 luma of the frame.
fn mean_luma<P>(samples: &[u8]) -> f32
where
    P: Pixel<Subpixel = u8>,
{
    let channels = P::CHANNEL_COUNT as usize;
    let pixels = samples.len() / channels.max(1);
    if pixels == 0 {
        return 0.0;
    }

    let total: f64 = samples
        .chunks_exact(channels)
        .map(|px| {
            if channels >= 3 {
                px[0] as f64 * 0.299 + px[1] as f64 * 0.587 + px[2] as f64 * 0.114
            } else {
                px[0] as f64
            }
        })
        .sum();

    (total / pixels as f64) as f32
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn plain_params() -> EnhanceParams {
        EnhanceParams {
            max_width: 64,
            max_height: 36,
            brightness: 1.0,
            contrast: 1.0,
            sharpness: 1.0,
            denoise: false,
        }
    }

    fn uniform_rgb(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value; 3])))
    }

    #[test]
    fn test_degenerate_inputs_are_processed() {
        let params = EnhanceParams::default();

        let single = uniform_rgb(1, 1, 90);
        let out = try_enhance(&single, &params).unwrap();
        assert_eq!((out.width(), out.height()), (1, 1));

        let black = uniform_rgb(32, 32, 0);
        let out = try_enhance(&black, &params).unwrap();
        assert!(out.to_rgb8().iter().all(|v| *v == 0));
    }

    #[test]
    fn test_never_upscales() {
        let image = uniform_rgb(40, 20, 128);
        let out = enhance(&image, &plain_params());
        assert_eq!((out.width(), out.height()), (40, 20));
    }

    #[test]
    fn test_downscale_preserves_aspect_ratio() {
        let image = uniform_rgb(300, 100, 128);
        let out = enhance(&image, &plain_params());
        assert_eq!(out.width(), 64);
        assert!((21..=22).contains(&out.height()));

        let tall = uniform_rgb(100, 200, 128);
        let out = enhance(&tall, &plain_params());
        assert_eq!(out.height(), 36);
        assert_eq!(out.width(), 18);
    }

    #[test]
    fn test_brightness_is_multiplicative() {
        let params = EnhanceParams {
            brightness: 2.0,
            ..plain_params()
        };

        let out = enhance(&uniform_rgb(4, 4, 50), &params).to_rgb8();
        assert!(out.iter().all(|v| *v == 100));

        let out = enhance(&uniform_rgb(4, 4, 200), &params).to_rgb8();
        assert!(out.iter().all(|v| *v == 255));
    }

    #[test]
    fn test_contrast_pivots_on_mean() {
        let params = EnhanceParams {
            contrast: 2.0,
            ..plain_params()
        };

        let flat = enhance(&uniform_rgb(4, 4, 77), &params).to_rgb8();
        assert!(flat.iter().all(|v| *v == 77));

        let mut gray = GrayImage::from_pixel(2, 1, Luma([100]));
        gray.put_pixel(1, 0, Luma([140]));
        let out = enhance(&DynamicImage::ImageLuma8(gray), &params).to_luma8();
        assert_eq!(out.get_pixel(0, 0).0[0], 80);
        assert_eq!(out.get_pixel(1, 0).0[0], 160);
    }

    #[test]
    fn test_sharpness_keeps_flat_regions() {
        let params = EnhanceParams {
            sharpness: 3.0,
            ..plain_params()
        };
        let out = enhance(&uniform_rgb(8, 8, 120), &params).to_rgb8();
        assert!(out.iter().all(|v| *v == 120));
    }

    #[test]
    fn test_sharpness_leaves_border_untouched() {
        let gray = GrayImage::from_fn(5, 5, |x, y| match (x, y) {
            (2, 2) => Luma([200]),
            _ => Luma([(x * 40 + y * 25) as u8]),
        });
        let params = EnhanceParams {
            sharpness: 2.5,
            ..plain_params()
        };

        let out = enhance(&DynamicImage::ImageLuma8(gray.clone()), &params).to_luma8();
        for (x, y, pixel) in gray.enumerate_pixels() {
            if x == 0 || y == 0 || x == 4 || y == 4 {
                assert_eq!(out.get_pixel(x, y), pixel);
            }
        }
        assert_ne!(out.get_pixel(2, 2), gray.get_pixel(2, 2));
    }

    #[test]
    fn test_denoise_removes_salt() {
        let mut gray = GrayImage::from_pixel(5, 5, Luma([10]));
        gray.put_pixel(2, 2, Luma([255]));
        let params = EnhanceParams {
            denoise: true,
            ..plain_params()
        };

        let out = enhance(&DynamicImage::ImageLuma8(gray), &params);
        assert!(matches!(out, DynamicImage::ImageLuma8(_)));
        assert_eq!(out.to_luma8().get_pixel(2, 2).0[0], 10);
    }

    #[test]
    fn test_empty_frame_falls_back_to_original() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(
            try_enhance(&empty, &EnhanceParams::default()),
            Err(ProcessingError::EmptyFrame)
        ));

        let out = enhance(&empty, &EnhanceParams::default());
        assert_eq!((out.width(), out.height()), (0, 0));
    }

    #[test]
    fn test_invalid_params_fall_back_to_original() {
        let image = uniform_rgb(100, 100, 60);
        let params = EnhanceParams {
            brightness: f32::NAN,
            ..plain_params()
        };

        let out = enhance(&image, &params);
        assert_eq!(out, image);
    }
}
