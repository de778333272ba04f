//! Turns sampled frames into [`FrameRecord`]s.

use crate::cache::ResultCache;
use crate::config::ExtractionConfig;
use crate::frame_store::FrameStore;
use crate::processor::{EncodePurpose, FrameProcessor};
use crate::record::FrameRecord;
use crate::source::Frame;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity of a frame within its session.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub stream_id: &'a str,
    pub session_id: &'a str,
    pub sequence: u64,
    /// Stream position in seconds
    pub timestamp: f64,
}

/// Processing, persistence and caching shared by all sessions.
pub struct FramePipeline {
    processor: Arc<FrameProcessor>,
    cache: Arc<ResultCache>,
    store: FrameStore,
}

impl FramePipeline {
    pub fn new(processor: Arc<FrameProcessor>, cache: Arc<ResultCache>, store: FrameStore) -> Self {
        Self {
            processor,
            cache,
            store,
        }
    }

    pub fn processor(&self) -> &FrameProcessor {
        &self.processor
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Process one frame into a record and cache it without its payload.
    /// Processing failures produce a degraded record instead of an error.
    pub fn run(&self, frame: &Frame, ctx: FrameContext<'_>, config: &ExtractionConfig) -> FrameRecord {
        let frame_id = FrameRecord::frame_id(ctx.session_id, ctx.sequence);

        let processed = match self.processor.process(&frame.image, config) {
            Ok(processed) => processed,
            Err(e) => {
                warn!(
                    frame_id = %frame_id,
                    error = %e,
                    "Frame processing failed, emitting raw frame"
                );
                self.processor.degraded(&frame.image, &e)
            }
        };

        let frame_path = if config.save_frames {
            self.persist(&frame_id, &processed.image)
        } else {
            None
        };

        let record = FrameRecord {
            frame_id,
            stream_id: ctx.stream_id.to_string(),
            session_id: ctx.session_id.to_string(),
            sequence: ctx.sequence,
            timestamp: ctx.timestamp,
            captured_at: Utc::now(),
            frame_path,
            features: processed.features,
            config: config.clone(),
            degraded: processed.degraded,
            payload: processed.payload,
        };

        self.cache.put(record.without_payload());
        debug!(
            frame_id = %record.frame_id,
            sequence = record.sequence,
            timestamp = record.timestamp,
            degraded = record.degraded,
            "Frame record ready"
        );

        record
    }

    fn persist(&self, frame_id: &str, image: &image::DynamicImage) -> Option<PathBuf> {
        let saved = self
            .processor
            .encode(image, EncodePurpose::Persist)
            .map_err(|e| e.to_string())
            .and_then(|jpeg| self.store.save(frame_id, &jpeg).map_err(|e| e.to_string()));

        match saved {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(frame_id = %frame_id, error = %e, "Failed to save frame");
                None
            }
        }
    }
}
