//! Frame extraction service.
//!
//! Samples frames from video streams at a fixed stream-time interval, enhances
//! them, extracts simple visual features and hands the results to consumers as
//! a pull-based, cancellable sequence of [`FrameRecord`]s.
//!
//! # Architecture
//!
//! ```text
//! SourceOpener -> ExtractionSession -> FramePipeline -> FrameStream
//!                                         |-> FrameProcessor (enhance, features, encode)
//!                                         |-> ResultCache
//!                                         '-> FrameStore (optional)
//! ```
//!
//! [`SessionRegistry`] is the control surface: it starts, stops and reports
//! on sessions, allowing one live session per stream id.

pub mod cache;
pub mod config;
pub mod enhance;
pub mod features;
pub mod frame_store;
#[cfg(feature = "gstreamer")]
pub mod gst_source;
pub mod kmeans;
pub mod pipeline;
pub mod processor;
pub mod record;
pub mod registry;
pub mod session;
pub mod source;

pub use config::{ExtractionConfig, ServiceConfig};
pub use record::FrameRecord;
pub use registry::{ExtractionError, RegistryStatus, SessionRegistry};
pub use session::{FrameStream, SessionMonitor, SessionSnapshot, SessionStatus};
pub use source::{Frame, FrameSource, SourceError, SourceOpener};
