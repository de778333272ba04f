//! Video source abstraction.
//!
//! A [`SourceOpener`] turns a URL into an exclusively owned [`FrameSource`]
//! handle. Every call is blocking and fallible; callers run them on the
//! blocking thread pool.

use crate::config::SourceConfig;
use image::{DynamicImage, Rgb, RgbImage};
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
#[cfg(not(feature = "gstreamer"))]
use tracing::warn;

/// URL scheme served by [`SyntheticSource`].
pub const SYNTHETIC_SCHEME: &str = "synthetic://";

/// Errors that can occur while talking to a video source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to open video source {url}: {reason}")]
    Open { url: String, reason: String },

    #[error("Failed to read frame: {0}")]
    Read(String),

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("End of stream")]
    EndOfStream,

    #[error("Unsupported source {0}")]
    Unsupported(String),
}

/// A decoded video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded pixels, either `Luma8` or `Rgb8`
    pub image: DynamicImage,

    /// Presentation timestamp reported by the decoder
    pub position: Option<Duration>,
}

impl Frame {
    /// Wrap a decoded image. Images with alpha or wide samples are converted
    /// to 8-bit RGB.
    pub fn new(image: DynamicImage) -> Self {
        let image = match image {
            DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => image,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        };

        Self {
            image,
            position: None,
        }
    }

    /// Attach the decoder's presentation timestamp.
    pub fn with_position(mut self, position: Duration) -> Self {
        self.position = Some(position);
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// An open, exclusively owned decoding handle.
pub trait FrameSource: Send {
    /// Decode the next frame. `Ok(None)` signals end of stream.
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Best-effort seek to a stream position in seconds.
    fn seek(&mut self, seconds: f64) -> Result<(), SourceError>;

    /// Nominal frame rate, if the container reports one.
    fn frame_rate(&self) -> Option<f64>;

    /// Release decoder resources. Must be idempotent.
    fn release(&mut self);
}

/// Opens [`FrameSource`] handles from URLs.
pub trait SourceOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Scoped owner of a source handle that releases it on drop.
pub struct SourceGuard {
    inner: Box<dyn FrameSource>,
}

impl SourceGuard {
    pub fn new(inner: Box<dyn FrameSource>) -> Self {
        Self { inner }
    }
}

impl Deref for SourceGuard {
    type Target = dyn FrameSource;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl DerefMut for SourceGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_mut()
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.inner.release();
        debug!("Video source released");
    }
}

/// Opener dispatching on the URL scheme.
///
/// `synthetic://` URLs are always served. Everything else goes to the
/// GStreamer backend when the `gstreamer` feature is enabled.
pub struct DefaultSourceOpener {
    config: SourceConfig,
}

impl DefaultSourceOpener {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, url: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        if url.starts_with(SYNTHETIC_SCHEME) {
            return Ok(Box::new(SyntheticSource::from_url(url)?));
        }
        open_decoder(url, &self.config)
    }
}

#[cfg(feature = "gstreamer")]
fn open_decoder(url: &str, config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    let source = crate::gst_source::GstSource::open(url, config)?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "gstreamer"))]
fn open_decoder(url: &str, _config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    warn!(url = %url, "No decoder backend compiled in for this URL");
    Err(SourceError::Open {
        url: url.to_string(),
        reason: SourceError::Unsupported(url.to_string()).to_string(),
    })
}

/// Deterministic moving test pattern.
///
/// URL form: `synthetic://<name>?fps=30&frames=300&width=320&height=240`.
/// `frames=0` produces an endless stream.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    fps: f64,
    total_frames: Option<u64>,
    width: u32,
    height: u32,
    next_index: u64,
    released: bool,
}

impl SyntheticSource {
    pub fn new(fps: f64, total_frames: Option<u64>, width: u32, height: u32) -> Self {
        Self {
            fps,
            total_frames,
            width,
            height,
            next_index: 0,
            released: false,
        }
    }

    /// Parse a `synthetic://` URL.
    pub fn from_url(url: &str) -> Result<Self, SourceError> {
        let invalid = |reason: String| SourceError::Open {
            url: url.to_string(),
            reason,
        };

        let rest = url
            .strip_prefix(SYNTHETIC_SCHEME)
            .ok_or_else(|| invalid("not a synthetic:// URL".to_string()))?;

        let mut source = Self::new(30.0, Some(300), 320, 240);

        let query = rest.split_once('?').map(|(_, q)| q).unwrap_or("");
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("malformed parameter {}", pair)))?;

            match key {
                "fps" => {
                    let fps: f64 = value
                        .parse()
                        .map_err(|_| invalid(format!("invalid fps {}", value)))?;
                    if !fps.is_finite() || fps <= 0.0 {
                        return Err(invalid(format!("invalid fps {}", value)));
                    }
                    source.fps = fps;
                }
                "frames" => {
                    let frames: u64 = value
                        .parse()
                        .map_err(|_| invalid(format!("invalid frame count {}", value)))?;
                    source.total_frames = (frames > 0).then_some(frames);
                }
                "width" | "height" => {
                    let size: u32 = value
                        .parse()
                        .ok()
                        .filter(|s| *s > 0)
                        .ok_or_else(|| invalid(format!("invalid {} {}", key, value)))?;
                    if key == "width" {
                        source.width = size;
                    } else {
                        source.height = size;
                    }
                }
                _ => return Err(invalid(format!("unknown parameter {}", key))),
            }
        }

        Ok(source)
    }

    fn render(&self, index: u64) -> RgbImage {
        let shift = (index * 4) as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let band = ((x + shift) / 16) % 2 == 0;
            Rgb([
                ((x + shift) % 256) as u8,
                (y % 256) as u8,
                if band { 200 } else { 40 },
            ])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.released {
            return Err(SourceError::Read("source released".to_string()));
        }
        if let Some(total) = self.total_frames {
            if self.next_index >= total {
                return Ok(None);
            }
        }

        let index = self.next_index;
        self.next_index += 1;

        let position = Duration::from_secs_f64(index as f64 / self.fps);
        Ok(Some(
            Frame::new(DynamicImage::ImageRgb8(self.render(index))).with_position(position),
        ))
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(SourceError::Seek(format!("invalid position {}", seconds)));
        }
        self.next_index = (seconds * self.fps).round() as u64;
        Ok(())
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn release(&mut self) {
        self.released = true;
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_url_parsing() {
        let source =
            SyntheticSource::from_url("synthetic://pattern?fps=25&frames=10&width=64&height=48")
                .unwrap();
        assert_eq!(source.frame_rate(), Some(25.0));
        assert_eq!(source.total_frames, Some(10));
        assert_eq!((source.width, source.height), (64, 48));

        let endless = SyntheticSource::from_url("synthetic://pattern?frames=0").unwrap();
        assert_eq!(endless.total_frames, None);
    }

    #[test]
    fn test_synthetic_url_rejects_garbage() {
        for url in [
            "synthetic://pattern?fps=abc",
            "synthetic://pattern?fps=-3",
            "synthetic://pattern?width=0",
            "synthetic://pattern?colour=red",
            "synthetic://pattern?fps",
        ] {
            assert!(
                matches!(SyntheticSource::from_url(url), Err(SourceError::Open { .. })),
                "{} should not open",
                url
            );
        }
    }

    #[test]
    fn test_synthetic_reads_until_end() {
        let mut source = SyntheticSource::new(10.0, Some(3), 8, 8);
        let mut positions = Vec::new();
        while let Some(frame) = source.read_frame().unwrap() {
            assert_eq!((frame.width(), frame.height()), (8, 8));
            positions.push(frame.position.unwrap());
        }
        assert_eq!(
            positions,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200)
            ]
        );
        assert!(source.read_frame().unwrap().is_none());
    }

    #[test]
    fn test_synthetic_seek() {
        let mut source = SyntheticSource::new(30.0, None, 4, 4);
        source.seek(10.0).unwrap();
        let frame = source.read_frame().unwrap().unwrap();
        assert_eq!(frame.position, Some(Duration::from_secs(10)));
        assert!(source.seek(-1.0).is_err());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let (source, tracker) = testing::ScriptedOpener::source(testing::Script::default());
        {
            let mut guard = SourceGuard::new(source);
            assert!(guard.read_frame().unwrap().is_some());
            assert!(!tracker.is_released());
        }
        assert!(tracker.is_released());
    }

    #[test]
    fn test_frame_normalizes_pixel_format() {
        let rgba = DynamicImage::ImageRgba8(image::RgbaImage::new(2, 2));
        assert!(matches!(Frame::new(rgba).image, DynamicImage::ImageRgb8(_)));

        let gray = DynamicImage::ImageLuma8(image::GrayImage::new(2, 2));
        assert!(matches!(Frame::new(gray).image, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_default_opener_serves_synthetic() {
        let opener = DefaultSourceOpener::new(SourceConfig::default());
        let mut source = opener.open("synthetic://pattern?frames=1").unwrap();
        assert!(source.read_frame().unwrap().is_some());
        assert!(source.read_frame().unwrap().is_none());
    }
}
