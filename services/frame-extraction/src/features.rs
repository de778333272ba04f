//! Per-frame feature extraction.

use crate::config::ProcessingConfig;
use crate::kmeans::{kmeans, KMeansParams, Point};
use crate::processor::ProcessingError;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use imageproc::edges::canny;
use serde::{Deserialize, Serialize};
use tracing::error;

/// Mean and standard deviation of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStat {
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub red: ChannelStat,
    pub green: ChannelStat,
    pub blue: ChannelStat,
}

/// Features of a successfully analysed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Mean over every sample of every channel.
    pub mean_brightness: f64,
    pub std_brightness: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_channels: Option<ChannelStats>,
    /// Cluster centers, colour frames only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dominant_colors: Vec<[u8; 3]>,
    /// Fraction of pixels on a Canny edge, in `[0, 1]`.
    pub edge_density: f64,
}

/// Minimal record emitted when feature extraction fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedFeatures {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameFeatures {
    Extracted(FeatureSet),
    Degraded(DegradedFeatures),
}

impl FrameFeatures {
    pub fn degraded(error: impl ToString) -> Self {
        FrameFeatures::Degraded(DegradedFeatures {
            timestamp: Utc::now(),
            error: error.to_string(),
        })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, FrameFeatures::Degraded(_))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            FrameFeatures::Extracted(set) => set.timestamp,
            FrameFeatures::Degraded(degraded) => degraded.timestamp,
        }
    }
}

/// Feature extraction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureParams {
    pub kmeans: KMeansParams,
    pub edge_low_threshold: f32,
    pub edge_high_threshold: f32,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self::from(&ProcessingConfig::default())
    }
}

impl From<&ProcessingConfig> for FeatureParams {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            kmeans: KMeansParams::from(config),
            edge_low_threshold: config.edge_low_threshold,
            edge_high_threshold: config.edge_high_threshold,
        }
    }
}

/// Extract features, degrading to a `{timestamp, error}` record on failure.
pub fn extract_features(image: &DynamicImage, params: &FeatureParams) -> FrameFeatures {
    match try_extract_features(image, params) {
        Ok(set) => FrameFeatures::Extracted(set),
        Err(e) => {
            error!(error = %e, "Feature extraction failed");
            FrameFeatures::degraded(e)
        }
    }
}

pub fn try_extract_features(
    image: &DynamicImage,
    params: &FeatureParams,
) -> Result<FeatureSet, ProcessingError> {
    let (low, high) = (params.edge_low_threshold, params.edge_high_threshold);
    if !low.is_finite() || !high.is_finite() || low < 0.0 || low > high {
        return Err(ProcessingError::InvalidParameter {
            name: "edge thresholds",
            value: format!("{}..{}", low, high),
        });
    }

    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(ProcessingError::EmptyFrame);
    }

    let gray = image.to_luma8();

    let (channels, overall, color_channels, dominant_colors) = match image {
        DynamicImage::ImageLuma8(luma) => (1u8, channel_stat(luma.iter().copied()), None, Vec::new()),
        other => {
            let rgb = other.to_rgb8();
            let samples: &[u8] = &rgb;
            let stats = ChannelStats {
                red: channel_stat(samples.iter().step_by(3).copied()),
                green: channel_stat(samples.iter().skip(1).step_by(3).copied()),
                blue: channel_stat(samples.iter().skip(2).step_by(3).copied()),
            };
            let points: Vec<Point> = rgb
                .pixels()
                .map(|p| [p.0[0] as f32, p.0[1] as f32, p.0[2] as f32])
                .collect();
            (
                3u8,
                channel_stat(samples.iter().copied()),
                Some(stats),
                dominant_colors(&points, &params.kmeans),
            )
        }
    };

    let edge_density = if width < 3 || height < 3 {
        0.0
    } else {
        let edges = canny(&gray, low, high);
        let on_edge = edges.iter().filter(|v| **v > 0).count();
        on_edge as f64 / (width as f64 * height as f64)
    };

    Ok(FeatureSet {
        timestamp: Utc::now(),
        width,
        height,
        channels,
        mean_brightness: overall.mean,
        std_brightness: overall.std,
        color_channels,
        dominant_colors,
        edge_density,
    })
}

fn dominant_colors(points: &[Point], params: &KMeansParams) -> Vec<[u8; 3]> {
    match kmeans(points, params) {
        Some(clustering) => clustering
            .centers
            .iter()
            .map(|c| [to_u8(c[0]), to_u8(c[1]), to_u8(c[2])])
            .collect(),
        None => Vec::new(),
    }
}

fn to_u8(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

/// Population mean and standard deviation.
fn channel_stat(samples: impl Iterator<Item = u8>) -> ChannelStat {
    let (mut n, mut sum, mut sum_sq) = (0u64, 0f64, 0f64);
    for v in samples {
        let v = v as f64;
        n += 1;
        sum += v;
        sum_sq += v * v;
    }
    if n == 0 {
        return ChannelStat { mean: 0.0, std: 0.0 };
    }
    let mean = sum / n as f64;
    let variance = (sum_sq / n as f64 - mean * mean).max(0.0);
    ChannelStat {
        mean,
        std: variance.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn seeded() -> FeatureParams {
        let mut params = FeatureParams::default();
        params.kmeans.seed = Some(42);
        params
    }

    #[test]
    fn test_single_pixel_frame() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([10, 20, 30])));
        let set = try_extract_features(&image, &seeded()).unwrap();

        assert_eq!((set.width, set.height, set.channels), (1, 1, 3));
        assert_eq!(set.dominant_colors, vec![[10, 20, 30]]);
        assert_eq!(set.edge_density, 0.0);
        assert!((set.mean_brightness - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_zero_frame() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(16, 16));
        let set = try_extract_features(&image, &seeded()).unwrap();

        assert_eq!(set.mean_brightness, 0.0);
        assert_eq!(set.std_brightness, 0.0);
        assert_eq!(set.edge_density, 0.0);
        assert_eq!(set.dominant_colors.len(), 3);
        assert!(set.dominant_colors.iter().all(|c| *c == [0, 0, 0]));
    }

    #[test]
    fn test_channel_statistics() {
        let mut rgb = RgbImage::from_pixel(2, 1, Rgb([0, 100, 50]));
        rgb.put_pixel(1, 0, Rgb([200, 100, 50]));
        let set = try_extract_features(&DynamicImage::ImageRgb8(rgb), &seeded()).unwrap();

        let stats = set.color_channels.unwrap();
        assert!((stats.red.mean - 100.0).abs() < 1e-9);
        assert!((stats.red.std - 100.0).abs() < 1e-9);
        assert!((stats.green.mean - 100.0).abs() < 1e-9);
        assert_eq!(stats.green.std, 0.0);
        assert!((stats.blue.mean - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_grayscale_frame_has_no_color_features() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([128])));
        let set = try_extract_features(&image, &seeded()).unwrap();

        assert_eq!(set.channels, 1);
        assert!(set.color_channels.is_none());
        assert!(set.dominant_colors.is_empty());
        assert!((set.mean_brightness - 128.0).abs() < 1e-9);
    }

    #[test]
    fn test_edge_density_on_step() {
        let gray = GrayImage::from_fn(32, 32, |x, _| if x < 16 { Luma([0]) } else { Luma([255]) });
        let set = try_extract_features(&DynamicImage::ImageLuma8(gray), &seeded()).unwrap();

        assert!(set.edge_density > 0.0);
        assert!(set.edge_density < 0.5);
    }

    #[test]
    fn test_empty_frame_degrades() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        let features = extract_features(&image, &seeded());

        assert!(features.is_degraded());
        match features {
            FrameFeatures::Degraded(d) => assert!(!d.error.is_empty()),
            other => panic!("expected degraded features, got {:?}", other),
        }
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let params = FeatureParams {
            edge_low_threshold: 200.0,
            edge_high_threshold: 100.0,
            ..seeded()
        };
        let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        assert!(matches!(
            try_extract_features(&image, &params),
            Err(ProcessingError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_serialized_shapes() {
        let degraded = serde_json::to_value(FrameFeatures::degraded("boom")).unwrap();
        assert_eq!(degraded["error"], "boom");
        assert!(degraded.get("timestamp").is_some());

        let image = DynamicImage::ImageLuma8(GrayImage::new(4, 4));
        let extracted = serde_json::to_value(extract_features(&image, &seeded())).unwrap();
        assert!(extracted.get("edge_density").is_some());
        assert!(extracted.get("color_channels").is_none());
        assert!(extracted.get("error").is_none());
    }
}
