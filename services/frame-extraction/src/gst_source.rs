//! GStreamer-backed video source.
//!
//! Builds a `uridecodebin` pipeline that ends in an RGB `appsink` and pulls
//! one sample per read, so decoding only advances as fast as the session
//! consumes frames.

use crate::config::SourceConfig;
use crate::source::{Frame, FrameSource, SourceError};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::{DynamicImage, RgbImage};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An open GStreamer decoding pipeline.
pub struct GstSource {
    url: String,
    pipeline: Option<gst::Pipeline>,
    appsink: gst_app::AppSink,
    read_timeout: Duration,
    frame_rate: Option<f64>,
    pending: Option<Frame>,
}

impl GstSource {
    /// Create the pipeline, start it and wait for the first decoded sample.
    pub fn open(url: &str, config: &SourceConfig) -> Result<Self, SourceError> {
        let open_error = |reason: String| SourceError::Open {
            url: url.to_string(),
            reason,
        };

        gst::init().map_err(|e| open_error(format!("GStreamer initialization failed: {}", e)))?;

        let pipeline_str = build_pipeline_string(url);
        debug!(pipeline = %pipeline_str, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| open_error(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| open_error("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| open_error("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| open_error("Could not cast to AppSink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| open_error(e.to_string()))?;

        let open_timeout = gst::ClockTime::from_mseconds(config.open_timeout().as_millis() as u64);
        let (result, _state, _pending) = pipeline.state(open_timeout);
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(open_error("Timeout waiting for pipeline to start".to_string()));
        }

        let mut source = Self {
            url: url.to_string(),
            pipeline: Some(pipeline),
            appsink,
            read_timeout: config.read_timeout(),
            frame_rate: None,
            pending: None,
        };

        // The first sample carries the negotiated caps, including the frame rate.
        match source.pull() {
            Ok(Some(frame)) => source.pending = Some(frame),
            Ok(None) => {
                source.release();
                return Err(open_error("Stream ended before the first frame".to_string()));
            }
            Err(e) => {
                source.release();
                return Err(open_error(e.to_string()));
            }
        }

        info!(
            url = %source.url,
            frame_rate = ?source.frame_rate,
            "Opened GStreamer source"
        );

        Ok(source)
    }

    fn pull(&mut self) -> Result<Option<Frame>, SourceError> {
        let timeout = gst::ClockTime::from_mseconds(self.read_timeout.as_millis() as u64);

        let sample = match self.appsink.try_pull_sample(timeout) {
            Some(sample) => sample,
            None if self.appsink.is_eos() => return Ok(None),
            None => return Err(SourceError::Read("Timed out waiting for a frame".to_string())),
        };

        let caps = sample
            .caps()
            .ok_or_else(|| SourceError::Read("Sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| SourceError::Read(e.to_string()))?;

        if self.frame_rate.is_none() {
            let fps = info.fps();
            if fps.numer() > 0 && fps.denom() > 0 {
                self.frame_rate = Some(fps.numer() as f64 / fps.denom() as f64);
            }
        }

        let buffer = sample
            .buffer()
            .ok_or_else(|| SourceError::Read("Sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| SourceError::Read("Buffer not readable".to_string()))?;

        let width = info.width();
        let height = info.height();
        let stride = info.stride()[0] as usize;
        let row_bytes = width as usize * 3;
        let data = map.as_slice();

        if stride < row_bytes || data.len() < stride * (height as usize).saturating_sub(1) + row_bytes
        {
            return Err(SourceError::Read(format!(
                "Buffer of {} bytes too small for {}x{} RGB",
                data.len(),
                width,
                height
            )));
        }

        // Rows may be padded; copy them out tightly packed.
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(&data[start..start + row_bytes]);
        }

        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| SourceError::Read("Frame size mismatch".to_string()))?;

        let mut frame = Frame::new(DynamicImage::ImageRgb8(image));
        if let Some(pts) = buffer.pts() {
            frame = frame.with_position(Duration::from_nanos(pts.nseconds()));
        }

        Ok(Some(frame))
    }
}

/// Build the GStreamer pipeline string.
fn build_pipeline_string(url: &str) -> String {
    format!(
        "uridecodebin uri={url} \
         ! videoconvert \
         ! video/x-raw,format=RGB \
         ! appsink name=sink sync=false max-buffers=1 drop=false",
        url = url,
    )
}

impl FrameSource for GstSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.pipeline.is_none() {
            return Err(SourceError::Read("Source released".to_string()));
        }
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.pull()
    }

    fn seek(&mut self, seconds: f64) -> Result<(), SourceError> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| SourceError::Seek("Source released".to_string()))?;

        if !seconds.is_finite() || seconds < 0.0 {
            return Err(SourceError::Seek(format!("Invalid position {}", seconds)));
        }

        pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
                gst::ClockTime::from_mseconds((seconds * 1000.0) as u64),
            )
            .map_err(|e| SourceError::Seek(e.to_string()))?;

        self.pending = None;
        Ok(())
    }

    fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gst::State::Null) {
                warn!(url = %self.url, error = %e, "Failed to stop GStreamer pipeline");
            }
            debug!(url = %self.url, "GStreamer pipeline stopped");
        }
        self.pending = None;
    }
}

impl Drop for GstSource {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_string() {
        let pipeline = build_pipeline_string("https://example.org/live.m3u8");
        assert!(pipeline.contains("uri=https://example.org/live.m3u8"));
        assert!(pipeline.contains("format=RGB"));
        assert!(pipeline.contains("appsink name=sink"));
    }
}
