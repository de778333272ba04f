//! Extraction sessions.
//!
//! An [`ExtractionSession`] owns one source handle and runs the sampling loop
//! for one stream on the blocking thread pool. Output is pull-based: the loop
//! waits for a request from its [`FrameStream`] before decoding anything, so
//! at most one record is in flight and a slow consumer slows decoding down
//! instead of queueing frames.
//!
//! Stopping is cooperative. The loop checks its cancellation token before
//! every read and while waiting for demand. Whatever way the loop ends
//! (including a panic) the source is released first, then the terminal
//! status is published, then the session is deregistered.

use crate::config::{ExtractionConfig, SessionConfig};
use crate::pipeline::{FrameContext, FramePipeline};
use crate::record::FrameRecord;
use crate::source::{FrameSource, SourceError, SourceGuard};
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Message recorded when a stream ends before yielding any record.
pub const EMPTY_STREAM_MESSAGE: &str = "stream ended before any frame was extracted";

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Stopped | SessionStatus::Failed
        )
    }

    /// Transitions only move forward: Idle -> Running -> terminal, or
    /// Idle -> Failed directly.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Idle, SessionStatus::Running) => true,
            (SessionStatus::Idle, SessionStatus::Failed) => true,
            (SessionStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub stream_id: String,
    pub session_id: String,
    pub url: String,
    pub status: SessionStatus,
    pub frames_extracted: u64,
    pub raw_frames: u64,
    pub degraded_frames: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub config: ExtractionConfig,
}

/// State shared between a session loop and its observers. Only the loop
/// (and the registry, before the loop starts) changes it.
pub struct SessionShared {
    pub stream_id: String,
    pub session_id: String,
    pub url: String,
    pub config: ExtractionConfig,
    pub started_at: DateTime<Utc>,
    status: watch::Sender<SessionStatus>,
    frames_extracted: AtomicU64,
    raw_frames: AtomicU64,
    degraded_frames: AtomicU64,
    error: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl SessionShared {
    pub fn new(stream_id: &str, url: &str, config: ExtractionConfig) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Arc::new(Self {
            stream_id: stream_id.to_string(),
            session_id: format!("{}_{}", stream_id, Uuid::new_v4().simple()),
            url: url.to_string(),
            config,
            started_at: Utc::now(),
            status,
            frames_extracted: AtomicU64::new(0),
            raw_frames: AtomicU64::new(0),
            degraded_frames: AtomicU64::new(0),
            error: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Apply a forward transition. Returns false if it was not allowed.
    pub(crate) fn transition(&self, next: SessionStatus) -> bool {
        self.status.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
        self.transition(SessionStatus::Failed);
    }

    /// Ask the loop to stop at its next check point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn frames_extracted(&self) -> u64 {
        self.frames_extracted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            stream_id: self.stream_id.clone(),
            session_id: self.session_id.clone(),
            url: self.url.clone(),
            status: self.status(),
            frames_extracted: self.frames_extracted.load(Ordering::Relaxed),
            raw_frames: self.raw_frames.load(Ordering::Relaxed),
            degraded_frames: self.degraded_frames.load(Ordering::Relaxed),
            started_at: self.started_at,
            error: self.error.lock().clone(),
            config: self.config.clone(),
        }
    }

    pub fn monitor(self: &Arc<Self>) -> SessionMonitor {
        SessionMonitor {
            shared: Arc::clone(self),
        }
    }
}

/// Read-only handle for observing a session.
#[derive(Clone)]
pub struct SessionMonitor {
    shared: Arc<SessionShared>,
}

impl SessionMonitor {
    pub fn stream_id(&self) -> &str {
        &self.shared.stream_id
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    /// Wait until the session reaches a terminal status.
    pub async fn wait(&self) -> SessionStatus {
        let mut rx = self.shared.status.subscribe();
        let result = rx.wait_for(|status| status.is_terminal()).await.map(|s| *s);
        result.unwrap_or_else(|_| self.shared.status())
    }
}

impl fmt::Debug for SessionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMonitor")
            .field("session_id", &self.shared.session_id)
            .field("status", &self.shared.status())
            .finish()
    }
}

type Demand = oneshot::Sender<FrameRecord>;

/// Lazy, finite sequence of records produced by one session.
///
/// Each [`FrameStream::recv`] call requests exactly one record. Dropping the
/// stream, or dropping a `recv` future before it resolves, stops the session.
pub struct FrameStream {
    requests: mpsc::Sender<Demand>,
    monitor: SessionMonitor,
}

impl FrameStream {
    /// Request the next record. Returns `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<FrameRecord> {
        let (reply, response) = oneshot::channel();
        self.requests.send(reply).await.ok()?;
        response.await.ok()
    }

    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    pub fn session_id(&self) -> &str {
        self.monitor.session_id()
    }

    /// Stop the session without waiting for it.
    pub fn cancel(&self) {
        self.monitor.shared.cancel();
    }

    /// Adapt into a [`futures::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = FrameRecord> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            stream.recv().await.map(|record| (record, stream))
        })
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.monitor.shared.cancel();
    }
}

/// Loop timing parameters.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Used when the source does not report a frame rate
    pub default_frame_rate: f64,
    /// Sleep between two raw frame reads
    pub fairness_pause: Duration,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            default_frame_rate: config.default_frame_rate,
            fairness_pause: config.fairness_pause(),
        }
    }
}

/// A session ready to run: shared state plus an already opened source.
pub struct ExtractionSession {
    shared: Arc<SessionShared>,
    source: SourceGuard,
    pipeline: Arc<FramePipeline>,
    settings: SessionSettings,
}

enum Exit {
    Completed,
    Stopped,
    Failed(String),
}

impl ExtractionSession {
    pub fn new(
        shared: Arc<SessionShared>,
        source: SourceGuard,
        pipeline: Arc<FramePipeline>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            shared,
            source,
            pipeline,
            settings,
        }
    }

    /// Mark the session running and start its loop on the blocking pool.
    /// `on_exit` runs last, after the source is released and the terminal
    /// status is published.
    pub fn spawn<F>(self, on_exit: F) -> FrameStream
    where
        F: FnOnce() + Send + 'static,
    {
        let (requests, demand) = mpsc::channel(1);
        let monitor = self.shared.monitor();

        self.shared.transition(SessionStatus::Running);
        info!(
            stream_id = %self.shared.stream_id,
            session_id = %self.shared.session_id,
            url = %self.shared.url,
            interval_seconds = self.shared.config.interval_seconds,
            max_frames = self.shared.config.max_frames,
            "Extraction session started"
        );

        tokio::task::spawn_blocking(move || self.run(demand, on_exit));

        FrameStream { requests, monitor }
    }

    fn run<F>(self, mut demand: mpsc::Receiver<Demand>, on_exit: F)
    where
        F: FnOnce(),
    {
        let ExtractionSession {
            shared,
            source,
            pipeline,
            settings,
        } = self;

        let mut guard = ExitGuard {
            shared: Arc::clone(&shared),
            source: Some(source),
            on_exit: Some(on_exit),
            exit: None,
        };

        let exit = match guard.source.as_mut() {
            Some(source) => sample(&shared, &mut **source, &pipeline, &settings, &mut demand),
            None => Exit::Failed("source missing".to_string()),
        };
        guard.exit = Some(exit);
    }
}

/// Runs the exit sequence when the loop returns or unwinds.
struct ExitGuard<F: FnOnce()> {
    shared: Arc<SessionShared>,
    source: Option<SourceGuard>,
    on_exit: Option<F>,
    exit: Option<Exit>,
}

impl<F: FnOnce()> Drop for ExitGuard<F> {
    fn drop(&mut self) {
        drop(self.source.take());

        let exit = self
            .exit
            .take()
            .unwrap_or_else(|| Exit::Failed("extraction worker panicked".to_string()));

        match exit {
            Exit::Completed => {
                self.shared.transition(SessionStatus::Completed);
            }
            Exit::Stopped => {
                self.shared.transition(SessionStatus::Stopped);
            }
            Exit::Failed(message) => self.shared.fail(message),
        }

        let snapshot = self.shared.snapshot();
        info!(
            stream_id = %snapshot.stream_id,
            session_id = %snapshot.session_id,
            status = %snapshot.status,
            frames_extracted = snapshot.frames_extracted,
            raw_frames = snapshot.raw_frames,
            degraded_frames = snapshot.degraded_frames,
            "Extraction session ended"
        );

        if let Some(on_exit) = self.on_exit.take() {
            on_exit();
        }
    }
}

/// Block until the consumer asks for a record or the session is cancelled.
fn wait_for_demand(cancel: &CancellationToken, demand: &mut mpsc::Receiver<Demand>) -> Option<Demand> {
    futures::executor::block_on(async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            request = demand.recv() => request,
        }
    })
}

fn sample(
    shared: &SessionShared,
    source: &mut dyn FrameSource,
    pipeline: &FramePipeline,
    settings: &SessionSettings,
    demand: &mut mpsc::Receiver<Demand>,
) -> Exit {
    let config = &shared.config;
    let frame_rate = source
        .frame_rate()
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(settings.default_frame_rate);
    let gate = config.frame_gate(frame_rate);
    let max_frames = u64::from(config.max_frames);

    debug!(
        session_id = %shared.session_id,
        frame_rate,
        gate,
        "Sampling gate configured"
    );

    let mut raw_index: u64 = 0;
    let mut sequence: u64 = 0;
    let mut pending: Option<Demand> = None;

    loop {
        if shared.is_cancelled() {
            return Exit::Stopped;
        }

        let reply = match pending.take() {
            Some(reply) => reply,
            None => match wait_for_demand(&shared.cancel, demand) {
                Some(reply) => reply,
                None => return Exit::Stopped,
            },
        };
        if reply.is_closed() {
            return Exit::Stopped;
        }

        if raw_index > 0 && !settings.fairness_pause.is_zero() {
            std::thread::sleep(settings.fairness_pause);
            if shared.is_cancelled() {
                return Exit::Stopped;
            }
        }

        let frame = match source.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return end_of_stream(shared, sequence, None),
            Err(e) => return end_of_stream(shared, sequence, Some(e)),
        };

        let index = raw_index;
        raw_index += 1;
        shared.raw_frames.fetch_add(1, Ordering::Relaxed);

        if index % gate != 0 {
            trace!(session_id = %shared.session_id, raw_index = index, "Frame skipped");
            pending = Some(reply);
            continue;
        }

        let timestamp = frame
            .position
            .map(|p| p.as_secs_f64())
            .unwrap_or(index as f64 / frame_rate);

        let ctx = FrameContext {
            stream_id: &shared.stream_id,
            session_id: &shared.session_id,
            sequence,
            timestamp,
        };
        let record = pipeline.run(&frame, ctx, config);

        if record.degraded {
            shared.degraded_frames.fetch_add(1, Ordering::Relaxed);
        }
        shared.frames_extracted.fetch_add(1, Ordering::Relaxed);
        sequence += 1;

        if reply.send(record).is_err() {
            debug!(session_id = %shared.session_id, "Consumer went away");
            return Exit::Stopped;
        }

        if sequence >= max_frames {
            return Exit::Completed;
        }
    }
}

fn end_of_stream(shared: &SessionShared, extracted: u64, error: Option<SourceError>) -> Exit {
    if let Some(e) = &error {
        warn!(session_id = %shared.session_id, error = %e, "Source read failed, ending session");
    }

    match (extracted, error) {
        (0, None) => Exit::Failed(EMPTY_STREAM_MESSAGE.to_string()),
        (0, Some(e)) => Exit::Failed(format!("{}: {}", EMPTY_STREAM_MESSAGE, e)),
        _ => Exit::Completed,
    }
}
