//! Frame processing: enhancement, feature extraction and JPEG encoding.
//!
//! [`FrameProcessor`] is stateless with respect to frames; the only state it
//! carries is its parameters and running statistics, so a single instance is
//! shared by every session.

use crate::config::{ExtractionConfig, ProcessingConfig};
use crate::enhance::{self, EnhanceParams};
use crate::features::{self, FeatureParams, FrameFeatures};
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use parking_lot::RwLock;
use std::time::Instant;
use thiserror::Error;
use tracing::trace;

/// Errors that can occur during frame processing.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Frame has no pixels")]
    EmptyFrame,

    #[error("Invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("Frame encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// What an encoded frame is for; selects the JPEG quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodePurpose {
    /// Inline payload on an emitted record.
    Transport,
    /// File written by the frame store.
    Persist,
}

/// Output of the processing pipeline for one frame.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// Enhanced frame, or the raw frame when enhancement is off or degraded.
    pub image: DynamicImage,
    pub features: Option<FrameFeatures>,
    /// Transport-quality JPEG.
    pub payload: Option<Bytes>,
    pub degraded: bool,
    pub processing_latency_us: u64,
}

/// Statistics for the frame processor.
#[derive(Debug, Default, Clone)]
pub struct ProcessorStats {
    pub frames_processed: u64,
    pub frames_degraded: u64,
    pub total_processing_time_us: u64,
    pub avg_processing_time_us: f64,
}

pub struct FrameProcessor {
    enhance: EnhanceParams,
    features: FeatureParams,
    transport_quality: u8,
    persist_quality: u8,
    stats: RwLock<ProcessorStats>,
}

impl FrameProcessor {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            enhance: EnhanceParams::from(config),
            features: FeatureParams::from(config),
            transport_quality: config.transport_quality,
            persist_quality: config.persist_quality,
            stats: RwLock::new(ProcessorStats::default()),
        }
    }

    /// Get current processor statistics.
    pub fn stats(&self) -> ProcessorStats {
        self.stats.read().clone()
    }

    /// Enhance a frame. Never fails; see [`enhance::enhance`].
    pub fn enhance(&self, image: &DynamicImage) -> DynamicImage {
        enhance::enhance(image, &self.enhance)
    }

    /// Extract features. Never fails; see [`features::extract_features`].
    pub fn extract_features(&self, image: &DynamicImage) -> FrameFeatures {
        features::extract_features(image, &self.features)
    }

    /// Encode a frame as JPEG with the quality configured for `purpose`.
    pub fn encode(&self, image: &DynamicImage, purpose: EncodePurpose) -> Result<Bytes, ProcessingError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ProcessingError::EmptyFrame);
        }

        let quality = match purpose {
            EncodePurpose::Transport => self.transport_quality,
            EncodePurpose::Persist => self.persist_quality,
        };

        let mut buf = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
        match image {
            DynamicImage::ImageLuma8(gray) => gray.write_with_encoder(encoder)?,
            other => other.to_rgb8().write_with_encoder(encoder)?,
        }

        Ok(Bytes::from(buf))
    }

    /// Run the configured stages over one frame.
    pub fn process(
        &self,
        image: &DynamicImage,
        config: &ExtractionConfig,
    ) -> Result<ProcessedFrame, ProcessingError> {
        let start = Instant::now();

        if image.width() == 0 || image.height() == 0 {
            return Err(ProcessingError::EmptyFrame);
        }

        let processed = if config.enhance_frames {
            self.enhance(image)
        } else {
            image.clone()
        };

        let features = config
            .extract_features
            .then(|| self.extract_features(&processed));
        let degraded = features.as_ref().is_some_and(FrameFeatures::is_degraded);

        let payload = self.encode(&processed, EncodePurpose::Transport)?;

        let latency = start.elapsed().as_micros() as u64;
        self.record(latency, degraded);
        trace!(
            width = processed.width(),
            height = processed.height(),
            latency_us = latency,
            "Frame processed"
        );

        Ok(ProcessedFrame {
            image: processed,
            features,
            payload: Some(payload),
            degraded,
            processing_latency_us: latency,
        })
    }

    /// Build the degraded output for a frame whose processing failed: the
    /// raw frame, minimal features and a best-effort payload.
    pub fn degraded(&self, image: &DynamicImage, error: &ProcessingError) -> ProcessedFrame {
        let payload = self.encode(image, EncodePurpose::Transport).ok();
        self.record(0, true);

        ProcessedFrame {
            image: image.clone(),
            features: Some(FrameFeatures::degraded(error)),
            payload,
            degraded: true,
            processing_latency_us: 0,
        }
    }

    fn record(&self, latency_us: u64, degraded: bool) {
        let mut stats = self.stats.write();
        stats.frames_processed += 1;
        if degraded {
            stats.frames_degraded += 1;
        }
        stats.total_processing_time_us += latency_us;
        stats.avg_processing_time_us =
            stats.total_processing_time_us as f64 / stats.frames_processed as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn small_config() -> ProcessingConfig {
        ProcessingConfig {
            resize_width: 64,
            resize_height: 36,
            kmeans_seed: Some(1),
            ..Default::default()
        }
    }

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 2) as u8, (y * 3) as u8, 128])
        }))
    }

    #[test]
    fn test_encode_produces_decodable_jpeg() {
        let processor = FrameProcessor::new(&small_config());
        let image = gradient(40, 30);

        for purpose in [EncodePurpose::Transport, EncodePurpose::Persist] {
            let bytes = processor.encode(&image, purpose).unwrap();
            assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (40, 30));
        }
    }

    #[test]
    fn test_encode_rejects_empty_frame() {
        let processor = FrameProcessor::new(&small_config());
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(matches!(
            processor.encode(&empty, EncodePurpose::Persist),
            Err(ProcessingError::EmptyFrame)
        ));
    }

    #[test]
    fn test_process_full_pipeline() {
        let processor = FrameProcessor::new(&small_config());
        let out = processor
            .process(&gradient(128, 72), &ExtractionConfig::default())
            .unwrap();

        assert_eq!((out.image.width(), out.image.height()), (64, 36));
        assert!(!out.degraded);
        assert!(matches!(out.features, Some(FrameFeatures::Extracted(_))));
        assert!(out.payload.is_some());
        assert_eq!(processor.stats().frames_processed, 1);
    }

    #[test]
    fn test_process_respects_stage_toggles() {
        let processor = FrameProcessor::new(&small_config());
        let config = ExtractionConfig {
            enhance_frames: false,
            extract_features: false,
            ..Default::default()
        };

        let image = gradient(128, 72);
        let out = processor.process(&image, &config).unwrap();
        assert_eq!(out.image, image);
        assert!(out.features.is_none());
    }

    #[test]
    fn test_degraded_output() {
        let processor = FrameProcessor::new(&small_config());
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));

        let err = processor
            .process(&empty, &ExtractionConfig::default())
            .unwrap_err();
        let out = processor.degraded(&empty, &err);

        assert!(out.degraded);
        assert!(out.payload.is_none());
        assert!(out.features.unwrap().is_degraded());
        assert_eq!(processor.stats().frames_degraded, 1);
    }
}
