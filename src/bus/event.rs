use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Emotion classes emitted by the external classifier.
///
/// Wire values the classifier is known to produce map onto these variants;
/// anything else becomes [`EmotionLabel::Unknown`], which no policy table
/// entry will ever match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionLabel {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Surprised,
    Disgusted,
    Unknown,
}

impl EmotionLabel {
    /// Maps a raw wire label onto a variant. Total: unrecognized values
    /// become `Unknown` instead of failing the decode.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutral" => Self::Neutral,
            "happy" => Self::Happy,
            "sad" => Self::Sad,
            "angry" | "anger" => Self::Angry,
            "fearful" | "fear" => Self::Fearful,
            "surprised" | "surprise" => Self::Surprised,
            "disgusted" | "disgust" => Self::Disgusted,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Neutral => "neutral",
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Fearful => "fearful",
            Self::Surprised => "surprised",
            Self::Disgusted => "disgusted",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// One emotion reading from the classifier. Immutable once decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct EmotionEvent {
    pub timestamp: DateTime<Utc>,
    pub subject_id: Option<String>,
    pub label: EmotionLabel,
    pub confidence: f32,
}

/// Payload shapes accepted off the wire.
///
/// The classifier's minimal form is `{"mood": "sad"}`; richer producers send
/// `label`, `confidence`, `timestamp` and `subject_id`. Absent confidence is
/// treated as a full-confidence reading, absent timestamp as receipt time.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(alias = "mood", alias = "emotion")]
    label: String,
    #[serde(default = "full_confidence")]
    confidence: f32,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "subjectId")]
    subject_id: Option<String>,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("confidence {0} outside 0.0..=1.0")]
    ConfidenceRange(f32),
}

impl EmotionEvent {
    pub fn new(label: EmotionLabel, confidence: f32) -> Self {
        Self {
            timestamp: Utc::now(),
            subject_id: None,
            label,
            confidence,
        }
    }

    pub fn at(label: EmotionLabel, confidence: f32, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            subject_id: None,
            label,
            confidence,
        }
    }

    /// Decodes a raw broker payload into an event.
    ///
    /// Unrecognized labels decode to [`EmotionLabel::Unknown`] rather than
    /// erroring; only structurally broken payloads are rejected.
    pub fn decode(payload: &[u8]) -> Result<Self, EventDecodeError> {
        let wire: WireEvent = serde_json::from_slice(payload)?;
        if !(0.0..=1.0).contains(&wire.confidence) {
            return Err(EventDecodeError::ConfidenceRange(wire.confidence));
        }
        Ok(Self {
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
            subject_id: wire.subject_id,
            label: EmotionLabel::from_wire(&wire.label),
            confidence: wire.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bare_classifier_payload() {
        let event = EmotionEvent::decode(br#"{"mood": "sad"}"#).unwrap();
        assert_eq!(event.label, EmotionLabel::Sad);
        assert_eq!(event.confidence, 1.0);
        assert!(event.subject_id.is_none());
    }

    #[test]
    fn decodes_full_payload() {
        let payload = br#"{
            "label": "angry",
            "confidence": 0.87,
            "timestamp": "2026-08-06T10:15:00Z",
            "subject_id": "driver-1"
        }"#;
        let event = EmotionEvent::decode(payload).unwrap();
        assert_eq!(event.label, EmotionLabel::Angry);
        assert_eq!(event.confidence, 0.87);
        assert_eq!(event.subject_id.as_deref(), Some("driver-1"));
        assert_eq!(event.timestamp.to_rfc3339(), "2026-08-06T10:15:00+00:00");
    }

    #[test]
    fn unrecognized_label_becomes_unknown() {
        let event = EmotionEvent::decode(br#"{"mood": "contemplative"}"#).unwrap();
        assert_eq!(event.label, EmotionLabel::Unknown);
    }

    #[test]
    fn classifier_raw_names_are_accepted() {
        assert_eq!(EmotionLabel::from_wire("fear"), EmotionLabel::Fearful);
        assert_eq!(EmotionLabel::from_wire("surprise"), EmotionLabel::Surprised);
        assert_eq!(EmotionLabel::from_wire("disgust"), EmotionLabel::Disgusted);
        assert_eq!(EmotionLabel::from_wire("ANGER"), EmotionLabel::Angry);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            EmotionEvent::decode(b"mood: sad"),
            Err(EventDecodeError::Json(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let err = EmotionEvent::decode(br#"{"mood": "sad", "confidence": 1.5}"#).unwrap_err();
        assert!(matches!(err, EventDecodeError::ConfidenceRange(_)));
    }
}
