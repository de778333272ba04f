//! Output records emitted for each extracted frame.

use crate::config::ExtractionConfig;
use crate::features::FrameFeatures;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One processed frame of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    /// `{session_id}_frame_{sequence}`
    pub frame_id: String,
    pub stream_id: String,
    pub session_id: String,
    /// Position among the session's extracted frames, starting at 0
    pub sequence: u64,
    /// Stream position in seconds
    pub timestamp: f64,
    /// Wall-clock time the frame was processed
    pub captured_at: DateTime<Utc>,
    /// Location of the persisted JPEG, if saved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FrameFeatures>,
    /// Settings the session ran with
    pub config: ExtractionConfig,
    /// Processing failed and the raw frame was emitted instead
    #[serde(default)]
    pub degraded: bool,
    /// Transport-quality JPEG, base64 encoded on the wire
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_payload"
    )]
    pub payload: Option<Bytes>,
}

impl FrameRecord {
    pub fn frame_id(session_id: &str, sequence: u64) -> String {
        format!("{}_frame_{}", session_id, sequence)
    }

    /// Copy of the record without the image payload.
    pub fn without_payload(&self) -> Self {
        Self {
            payload: None,
            ..self.clone()
        }
    }
}

/// Base64 serialization helper
mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(payload: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match payload {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Bytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map(Bytes::from))
            .transpose()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> FrameRecord {
        FrameRecord {
            frame_id: FrameRecord::frame_id("lobby_abc", 4),
            stream_id: "lobby".to_string(),
            session_id: "lobby_abc".to_string(),
            sequence: 4,
            timestamp: 8.0,
            captured_at: Utc::now(),
            frame_path: None,
            features: Some(FrameFeatures::degraded("decoder hiccup")),
            config: ExtractionConfig::default(),
            degraded: true,
            payload: Some(Bytes::from_static(b"\xFF\xD8jpeg")),
        }
    }

    #[test]
    fn test_frame_id_format() {
        assert_eq!(FrameRecord::frame_id("cam_1f2e", 0), "cam_1f2e_frame_0");
        assert_eq!(sample_record().frame_id, "lobby_abc_frame_4");
    }

    #[test]
    fn test_without_payload() {
        let record = sample_record();
        let light = record.without_payload();

        assert!(record.payload.is_some());
        assert!(light.payload.is_none());
        assert_eq!(light.frame_id, record.frame_id);
        assert_eq!(light.features, record.features);
    }

    #[test]
    fn test_json_event_shape() {
        let record = sample_record();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["payload"], "/9hqcGVn");
        assert_eq!(json["features"]["error"], "decoder hiccup");
        assert_eq!(json["config"]["interval_seconds"], 2.0);
        assert!(json.get("frame_path").is_none());

        let light = serde_json::to_value(record.without_payload()).unwrap();
        assert!(light.get("payload").is_none());

        let parsed: FrameRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.payload, record.payload);
    }
}
