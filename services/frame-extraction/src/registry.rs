//! Process-wide registry of extraction sessions.
//!
//! The registry owns the session table, the result cache, the processing
//! pipeline and the source opener. It allows at most one live session per
//! stream id; sessions remove themselves from the table when they end.
//! The table lock is never held while the cache is touched.

use crate::cache::ResultCache;
use crate::config::{ConfigValidationError, ExtractionConfig, ServiceConfig, SourceConfig};
use crate::frame_store::FrameStore;
use crate::pipeline::{FrameContext, FramePipeline};
use crate::processor::{FrameProcessor, ProcessorStats};
use crate::record::FrameRecord;
use crate::session::{
    ExtractionSession, FrameStream, SessionMonitor, SessionSettings, SessionShared,
    SessionSnapshot, SessionStatus,
};
use crate::source::{DefaultSourceOpener, SourceError, SourceGuard, SourceOpener};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Errors surfaced by the registry's control operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Extraction already running for stream {0}")]
    AlreadyRunning(String),

    #[error(transparent)]
    SourceOpen(SourceError),

    #[error("Invalid extraction config: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    #[error("Invalid source URL: {0}")]
    InvalidUrl(ConfigValidationError),

    #[error("Frame read failed: {0}")]
    Read(SourceError),

    #[error("Extraction task failed: {0}")]
    Task(String),
}

/// Summary of the registry's state.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    /// Number of running sessions
    pub running: usize,
    /// Number of cached frame records
    pub cached: usize,
    /// Stream ids of running sessions, sorted
    pub active_ids: Vec<String>,
    /// Every registered session, sorted by stream id
    pub sessions: Vec<SessionSnapshot>,
}

type SessionTable = Arc<Mutex<HashMap<String, Arc<SessionShared>>>>;

pub struct SessionRegistry {
    sessions: SessionTable,
    opener: Arc<dyn SourceOpener>,
    pipeline: Arc<FramePipeline>,
    source_config: SourceConfig,
    settings: SessionSettings,
}

impl SessionRegistry {
    /// Create a registry with the default source opener.
    pub fn new(config: &ServiceConfig) -> Self {
        let opener = Arc::new(DefaultSourceOpener::new(config.source.clone()));
        Self::with_opener(config, opener)
    }

    pub fn with_opener(config: &ServiceConfig, opener: Arc<dyn SourceOpener>) -> Self {
        let cache = Arc::new(ResultCache::new(config.cache.max_entries));
        let processor = Arc::new(FrameProcessor::new(&config.processing));
        let store = FrameStore::new(config.storage.frames_dir.clone());

        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            opener,
            pipeline: Arc::new(FramePipeline::new(processor, cache, store)),
            source_config: config.source.clone(),
            settings: SessionSettings::from(&config.session),
        }
    }

    /// Start a session whose records are drained into the cache in the
    /// background.
    pub async fn start(
        &self,
        stream_id: &str,
        url: &str,
        config: ExtractionConfig,
    ) -> Result<SessionMonitor, ExtractionError> {
        let mut stream = self.stream(stream_id, url, config).await?;
        let monitor = stream.monitor().clone();

        tokio::spawn(async move {
            while let Some(record) = stream.recv().await {
                debug!(frame_id = %record.frame_id, "Background frame cached");
            }
        });

        Ok(monitor)
    }

    /// Start a session and hand its record stream to the caller.
    pub async fn stream(
        &self,
        stream_id: &str,
        url: &str,
        config: ExtractionConfig,
    ) -> Result<FrameStream, ExtractionError> {
        config.validate()?;
        self.source_config
            .check_url(url)
            .map_err(ExtractionError::InvalidUrl)?;

        let reservation = Reservation {
            table: Arc::clone(&self.sessions),
            shared: self.reserve(stream_id, url, config)?,
            armed: true,
        };

        // An open that outlives this call still hands its source to a guard.
        let opener = Arc::clone(&self.opener);
        let open_url = url.to_string();
        let opened =
            tokio::task::spawn_blocking(move || opener.open(&open_url).map(SourceGuard::new)).await;

        let source = match opened {
            Ok(Ok(source)) => source,
            Ok(Err(e)) => {
                error!(stream_id = %stream_id, url = %url, error = %e, "Failed to open video source");
                reservation.abandon(e.to_string());
                return Err(ExtractionError::SourceOpen(e));
            }
            Err(e) => {
                error!(stream_id = %stream_id, error = %e, "Source open task failed");
                reservation.abandon(e.to_string());
                return Err(ExtractionError::Task(e.to_string()));
            }
        };

        let shared = reservation.claim();
        let session = ExtractionSession::new(
            Arc::clone(&shared),
            source,
            Arc::clone(&self.pipeline),
            self.settings.clone(),
        );

        let table = Arc::clone(&self.sessions);
        let on_exit = move || deregister(&table, &shared);

        Ok(session.spawn(on_exit))
    }

    /// Stop a session and wait for it to end. Unknown or finished stream ids
    /// are ignored. Returns the terminal status of the stopped session.
    pub async fn stop(&self, stream_id: &str) -> Option<SessionStatus> {
        let shared = self.live(stream_id)?;

        info!(stream_id = %stream_id, session_id = %shared.session_id, "Stopping extraction");
        shared.cancel();
        Some(shared.monitor().wait().await)
    }

    pub fn status(&self) -> RegistryStatus {
        let registered: Vec<Arc<SessionShared>> = self.sessions.lock().values().cloned().collect();

        // Terminal entries are about to deregister themselves.
        let mut sessions: Vec<SessionSnapshot> = registered
            .iter()
            .map(|s| s.snapshot())
            .filter(|s| !s.status.is_terminal())
            .collect();
        sessions.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));

        let active_ids: Vec<String> = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Running)
            .map(|s| s.stream_id.clone())
            .collect();

        RegistryStatus {
            running: active_ids.len(),
            cached: self.pipeline.cache().len(),
            active_ids,
            sessions,
        }
    }

    pub fn monitor(&self, stream_id: &str) -> Option<SessionMonitor> {
        self.live(stream_id).map(|s| s.monitor())
    }

    pub fn cached_frame(&self, frame_id: &str) -> Option<FrameRecord> {
        self.pipeline.cache().get(frame_id)
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.pipeline.processor().stats()
    }

    /// Grab one frame, optionally at `timestamp` seconds, with enhancement and
    /// feature extraction on. If seeking fails the current position is used.
    pub async fn single_frame(
        &self,
        url: &str,
        timestamp: Option<f64>,
    ) -> Result<FrameRecord, ExtractionError> {
        self.source_config
            .check_url(url)
            .map_err(ExtractionError::InvalidUrl)?;

        let opener = Arc::clone(&self.opener);
        let pipeline = Arc::clone(&self.pipeline);
        let url = url.to_string();

        tokio::task::spawn_blocking(move || {
            let source = opener.open(&url).map_err(|e| {
                error!(url = %url, error = %e, "Failed to open video source");
                ExtractionError::SourceOpen(e)
            })?;
            grab_single(SourceGuard::new(source), &pipeline, timestamp)
        })
        .await
        .map_err(|e| ExtractionError::Task(e.to_string()))?
    }

    /// Stop every session and wait for all of them to end.
    pub async fn shutdown(&self) {
        let registered: Vec<Arc<SessionShared>> = self.sessions.lock().values().cloned().collect();
        if registered.is_empty() {
            return;
        }

        info!(sessions = registered.len(), "Stopping all extraction sessions");
        for shared in &registered {
            shared.cancel();
        }
        for shared in registered {
            shared.monitor().wait().await;
        }
        info!("All extraction sessions stopped");
    }

    /// Claim the stream id for a new session.
    fn reserve(
        &self,
        stream_id: &str,
        url: &str,
        config: ExtractionConfig,
    ) -> Result<Arc<SessionShared>, ExtractionError> {
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(stream_id) {
            if !existing.status().is_terminal() {
                warn!(
                    stream_id = %stream_id,
                    session_id = %existing.session_id,
                    "Extraction already running"
                );
                return Err(ExtractionError::AlreadyRunning(stream_id.to_string()));
            }
        }

        let shared = SessionShared::new(stream_id, url, config);
        sessions.insert(stream_id.to_string(), Arc::clone(&shared));
        Ok(shared)
    }

    fn live(&self, stream_id: &str) -> Option<Arc<SessionShared>> {
        self.sessions
            .lock()
            .get(stream_id)
            .filter(|s| !s.status().is_terminal())
            .cloned()
    }
}

/// A claimed stream id whose source is still being opened. Dropped without
/// being claimed, it fails the session and frees the id.
struct Reservation {
    table: SessionTable,
    shared: Arc<SessionShared>,
    armed: bool,
}

impl Reservation {
    fn claim(mut self) -> Arc<SessionShared> {
        self.armed = false;
        Arc::clone(&self.shared)
    }

    fn abandon(mut self, message: String) {
        self.armed = false;
        self.release(message);
    }

    fn release(&self, message: String) {
        self.shared.fail(message);
        deregister(&self.table, &self.shared);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            warn!(
                stream_id = %self.shared.stream_id,
                session_id = %self.shared.session_id,
                "Extraction start abandoned while opening source"
            );
            self.release("start cancelled before the source was opened".to_string());
        }
    }
}

/// Drop a session's table entry unless it has already been replaced.
fn deregister(table: &Mutex<HashMap<String, Arc<SessionShared>>>, shared: &SessionShared) {
    let mut sessions = table.lock();
    let owned = sessions
        .get(&shared.stream_id)
        .is_some_and(|entry| entry.session_id == shared.session_id);
    if owned {
        sessions.remove(&shared.stream_id);
    }
}

fn grab_single(
    mut source: SourceGuard,
    pipeline: &FramePipeline,
    timestamp: Option<f64>,
) -> Result<FrameRecord, ExtractionError> {
    let mut seeked = false;
    if let Some(seconds) = timestamp {
        match source.seek(seconds) {
            Ok(()) => seeked = true,
            Err(e) => warn!(
                timestamp = seconds,
                error = %e,
                "Seek failed, using current position"
            ),
        }
    }

    let frame = source
        .read_frame()
        .map_err(ExtractionError::Read)?
        .ok_or(ExtractionError::Read(SourceError::EndOfStream))?;
    drop(source);

    let position = match (frame.position, timestamp) {
        (Some(position), _) => position.as_secs_f64(),
        (None, Some(seconds)) if seeked => seconds,
        _ => 0.0,
    };

    let session_id = format!("single_{}", Uuid::new_v4().simple());
    let config = ExtractionConfig {
        enhance_frames: true,
        extract_features: true,
        save_frames: false,
        ..Default::default()
    };
    let ctx = FrameContext {
        stream_id: &session_id,
        session_id: &session_id,
        sequence: 0,
        timestamp: position,
    };

    Ok(pipeline.run(&frame, ctx, &config))
}
