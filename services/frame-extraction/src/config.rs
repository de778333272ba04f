//! Configuration management for the frame extraction service.
//!
//! Service-wide settings are loaded from configuration files and environment
//! variables. Per-session settings travel with each start request as an
//! [`ExtractionConfig`].

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Bounds accepted for [`ExtractionConfig::interval_seconds`].
pub const MIN_INTERVAL_SECONDS: f64 = 0.1;
pub const MAX_INTERVAL_SECONDS: f64 = 60.0;

/// Bounds accepted for [`ExtractionConfig::max_frames`].
pub const MIN_MAX_FRAMES: u32 = 1;
pub const MAX_MAX_FRAMES: u32 = 10_000;

/// Main configuration for the frame extraction service.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    /// Enhancement, feature extraction and encoding parameters
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Result cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Persisted frame configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Session loop configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Video source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Streams started when the service boots
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// Per-session extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Seconds of stream time between two extracted frames
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,

    /// Number of frames after which the session completes
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,

    /// Run the enhancement stage on every extracted frame
    #[serde(default = "default_true")]
    pub enhance_frames: bool,

    /// Write every extracted frame to the frames directory
    #[serde(default)]
    pub save_frames: bool,

    /// Run the feature extraction stage on every extracted frame
    #[serde(default = "default_true")]
    pub extract_features: bool,
}

/// Frame processing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Width of the bounding box frames are shrunk to fit into
    #[serde(default = "default_resize_width")]
    pub resize_width: u32,

    /// Height of the bounding box frames are shrunk to fit into
    #[serde(default = "default_resize_height")]
    pub resize_height: u32,

    /// Multiplicative brightness factor (1.0 = unchanged)
    #[serde(default = "default_brightness")]
    pub brightness: f32,

    /// Multiplicative contrast factor (1.0 = unchanged)
    #[serde(default = "default_contrast")]
    pub contrast: f32,

    /// Multiplicative sharpness factor (1.0 = unchanged)
    #[serde(default = "default_sharpness")]
    pub sharpness: f32,

    /// Apply a 3x3 median filter after the adjustments
    #[serde(default = "default_true")]
    pub denoise: bool,

    /// JPEG quality for payloads handed to consumers
    #[serde(default = "default_transport_quality")]
    pub transport_quality: u8,

    /// JPEG quality for frames written to disk
    #[serde(default = "default_persist_quality")]
    pub persist_quality: u8,

    /// Number of dominant colors reported per frame
    #[serde(default = "default_dominant_colors")]
    pub dominant_colors: usize,

    /// k-means iteration limit per attempt
    #[serde(default = "default_kmeans_max_iterations")]
    pub kmeans_max_iterations: u32,

    /// k-means convergence threshold on centroid movement
    #[serde(default = "default_kmeans_epsilon")]
    pub kmeans_epsilon: f32,

    /// Number of k-means restarts, the most compact clustering wins
    #[serde(default = "default_kmeans_attempts")]
    pub kmeans_attempts: u32,

    /// Fixed seed for k-means initialisation (random when unset)
    #[serde(default)]
    pub kmeans_seed: Option<u64>,

    /// Canny hysteresis low threshold
    #[serde(default = "default_edge_low_threshold")]
    pub edge_low_threshold: f32,

    /// Canny hysteresis high threshold
    #[serde(default = "default_edge_high_threshold")]
    pub edge_high_threshold: f32,
}

/// Result cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached frame records
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

/// Persisted frame configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Flat directory receiving `{frame_id}.jpg` files
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
}

/// Session loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Frame rate assumed when the source does not report one
    #[serde(default = "default_frame_rate")]
    pub default_frame_rate: f64,

    /// Pause between two raw frame reads in milliseconds
    #[serde(default = "default_fairness_pause_ms")]
    pub fairness_pause_ms: u64,
}

/// Video source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// URL schemes accepted by `start`
    #[serde(default = "default_allowed_schemes")]
    pub allowed_schemes: Vec<String>,

    /// Maximum wait for one decoded frame in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Maximum wait for the decoder to start in seconds
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// A stream started at boot.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Stream identifier
    pub id: String,

    /// Source URL
    pub url: String,

    /// Extraction settings for this stream
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_interval_seconds() -> f64 {
    2.0
}
fn default_max_frames() -> u32 {
    1000
}
fn default_resize_width() -> u32 {
    1280
}
fn default_resize_height() -> u32 {
    720
}
fn default_brightness() -> f32 {
    1.1
}
fn default_contrast() -> f32 {
    1.2
}
fn default_sharpness() -> f32 {
    1.1
}
fn default_transport_quality() -> u8 {
    85
}
fn default_persist_quality() -> u8 {
    90
}
fn default_dominant_colors() -> usize {
    3
}
fn default_kmeans_max_iterations() -> u32 {
    20
}
fn default_kmeans_epsilon() -> f32 {
    1.0
}
fn default_kmeans_attempts() -> u32 {
    10
}
fn default_edge_low_threshold() -> f32 {
    50.0
}
fn default_edge_high_threshold() -> f32 {
    150.0
}
fn default_cache_entries() -> usize {
    100
}
fn default_frames_dir() -> PathBuf {
    PathBuf::from("frames")
}
fn default_frame_rate() -> f64 {
    30.0
}
fn default_fairness_pause_ms() -> u64 {
    10
}
fn default_allowed_schemes() -> Vec<String> {
    ["http", "https", "rtsp", "rtsps", "file", "synthetic"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_read_timeout_ms() -> u64 {
    5000
}
fn default_open_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            max_frames: default_max_frames(),
            enhance_frames: true,
            save_frames: false,
            extract_features: true,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            resize_width: default_resize_width(),
            resize_height: default_resize_height(),
            brightness: default_brightness(),
            contrast: default_contrast(),
            sharpness: default_sharpness(),
            denoise: true,
            transport_quality: default_transport_quality(),
            persist_quality: default_persist_quality(),
            dominant_colors: default_dominant_colors(),
            kmeans_max_iterations: default_kmeans_max_iterations(),
            kmeans_epsilon: default_kmeans_epsilon(),
            kmeans_attempts: default_kmeans_attempts(),
            kmeans_seed: None,
            edge_low_threshold: default_edge_low_threshold(),
            edge_high_threshold: default_edge_high_threshold(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            frames_dir: default_frames_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_frame_rate: default_frame_rate(),
            fairness_pause_ms: default_fairness_pause_ms(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            allowed_schemes: default_allowed_schemes(),
            read_timeout_ms: default_read_timeout_ms(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with EXTRACT_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. EXTRACT_CACHE__MAX_ENTRIES=50
            .add_source(
                Environment::with_prefix("EXTRACT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("EXTRACT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.processing.validate()?;

        if self.cache.max_entries == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "cache.max_entries".to_string(),
                message: "Cache must hold at least one entry".to_string(),
            });
        }

        if !self.session.default_frame_rate.is_finite() || self.session.default_frame_rate <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "session.default_frame_rate".to_string(),
                message: "Frame rate must be greater than 0".to_string(),
            });
        }

        if self.source.allowed_schemes.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "source.allowed_schemes".to_string(),
            ));
        }

        for stream in &self.streams {
            if stream.id.is_empty() {
                return Err(ConfigValidationError::MissingField("streams.id".to_string()));
            }
            if stream.url.is_empty() {
                return Err(ConfigValidationError::MissingField(format!(
                    "streams.{}.url",
                    stream.id
                )));
            }
            stream.extraction.validate()?;
        }

        Ok(())
    }
}

impl ExtractionConfig {
    /// Validate the per-session ranges.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if !(MIN_INTERVAL_SECONDS..=MAX_INTERVAL_SECONDS).contains(&self.interval_seconds) {
            return Err(ConfigValidationError::InvalidValue {
                field: "interval_seconds".to_string(),
                message: format!(
                    "{} is outside {}..={}",
                    self.interval_seconds, MIN_INTERVAL_SECONDS, MAX_INTERVAL_SECONDS
                ),
            });
        }

        if !(MIN_MAX_FRAMES..=MAX_MAX_FRAMES).contains(&self.max_frames) {
            return Err(ConfigValidationError::InvalidValue {
                field: "max_frames".to_string(),
                message: format!(
                    "{} is outside {}..={}",
                    self.max_frames, MIN_MAX_FRAMES, MAX_MAX_FRAMES
                ),
            });
        }

        Ok(())
    }

    /// Number of decoded frames between two extracted frames.
    pub fn frame_gate(&self, frame_rate: f64) -> u64 {
        let frames = (frame_rate * self.interval_seconds).round();
        if frames.is_finite() && frames >= 1.0 {
            frames as u64
        } else {
            1
        }
    }
}

impl ProcessingConfig {
    fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.resize_width == 0 || self.resize_height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.resize_width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        for (field, factor) in [
            ("processing.brightness", self.brightness),
            ("processing.contrast", self.contrast),
            ("processing.sharpness", self.sharpness),
        ] {
            if !factor.is_finite() || factor < 0.0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "Factor must be a finite, non-negative number".to_string(),
                });
            }
        }

        for (field, quality) in [
            ("processing.transport_quality", self.transport_quality),
            ("processing.persist_quality", self.persist_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "JPEG quality must be within 1..=100".to_string(),
                });
            }
        }

        if self.kmeans_attempts == 0 || self.kmeans_max_iterations == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.kmeans_attempts/max_iterations".to_string(),
                message: "k-means needs at least one attempt and one iteration".to_string(),
            });
        }

        if self.edge_low_threshold > self.edge_high_threshold {
            return Err(ConfigValidationError::InvalidValue {
                field: "processing.edge_low_threshold".to_string(),
                message: "Low threshold must not exceed the high threshold".to_string(),
            });
        }

        Ok(())
    }
}

impl SessionConfig {
    /// Get the fairness pause as Duration.
    pub fn fairness_pause(&self) -> Duration {
        Duration::from_millis(self.fairness_pause_ms)
    }
}

impl SourceConfig {
    /// Get the frame read timeout as Duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Get the decoder start timeout as Duration.
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// Check a source URL against the allowed schemes.
    pub fn check_url(&self, url: &str) -> Result<(), ConfigValidationError> {
        if url.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("url".to_string()));
        }

        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| ConfigValidationError::InvalidValue {
                field: "url".to_string(),
                message: format!("{} has no scheme", url),
            })?;

        if self
            .allowed_schemes
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&scheme))
        {
            Ok(())
        } else {
            Err(ConfigValidationError::InvalidValue {
                field: "url".to_string(),
                message: format!("scheme {} is not allowed", scheme),
            })
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn create_test_config() -> ServiceConfig {
        ServiceConfig {
            streams: vec![StreamConfig {
                id: "red-panda".to_string(),
                url: "https://example.org/live.m3u8".to_string(),
                extraction: ExtractionConfig::default(),
            }],
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_extraction_defaults() {
        let config = ExtractionConfig::default();
        assert_eq!(config.interval_seconds, 2.0);
        assert_eq!(config.max_frames, 1000);
        assert!(config.enhance_frames);
        assert!(!config.save_frames);
        assert!(config.extract_features);
    }

    #[test]
    fn test_interval_out_of_range() {
        for interval in [0.05, 60.5, f64::NAN] {
            let config = ExtractionConfig {
                interval_seconds: interval,
                ..ExtractionConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigValidationError::InvalidValue { .. })
            ));
        }
    }

    #[test]
    fn test_max_frames_bounds() {
        let mut config = ExtractionConfig {
            max_frames: 0,
            ..ExtractionConfig::default()
        };
        assert!(config.validate().is_err());

        config.max_frames = 10_001;
        assert!(config.validate().is_err());

        config.max_frames = 10_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frame_gate() {
        let config = ExtractionConfig {
            interval_seconds: 2.0,
            ..ExtractionConfig::default()
        };
        assert_eq!(config.frame_gate(30.0), 60);
        assert_eq!(config.frame_gate(29.97), 60);

        let fast = ExtractionConfig {
            interval_seconds: 0.1,
            ..ExtractionConfig::default()
        };
        assert_eq!(fast.frame_gate(4.0), 1);
        assert_eq!(fast.frame_gate(0.0), 1);
    }

    #[test]
    fn test_invalid_stream_in_config() {
        let mut config = create_test_config();
        config.streams[0].extraction.max_frames = 0;
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.streams[0].url = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_invalid_processing() {
        let mut config = create_test_config();
        config.processing.resize_width = 0;
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.processing.transport_quality = 0;
        assert!(config.validate().is_err());

        let mut config = create_test_config();
        config.processing.edge_low_threshold = 200.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_check_url() {
        let source = SourceConfig::default();
        assert!(source.check_url("https://example.org/stream").is_ok());
        assert!(source.check_url("SYNTHETIC://pattern").is_ok());
        assert!(source.check_url("").is_err());
        assert!(source.check_url("no-scheme").is_err());
        assert!(source.check_url("ftp://example.org/video").is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let toml = r#"
            [cache]
            max_entries = 25

            [session]
            fairness_pause_ms = 0

            [[streams]]
            id = "otters"
            url = "synthetic://pattern?fps=25"

            [streams.extraction]
            interval_seconds = 1.5
            max_frames = 12
        "#;

        let config: ServiceConfig = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.cache.max_entries, 25);
        assert_eq!(config.session.fairness_pause(), Duration::ZERO);
        assert_eq!(config.processing.resize_width, 1280);
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].extraction.interval_seconds, 1.5);
        assert_eq!(config.streams[0].extraction.max_frames, 12);
        assert!(config.streams[0].extraction.extract_features);
        assert!(config.validate().is_ok());
    }
}
