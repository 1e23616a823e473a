//! Push frame codec.
//!
//! The server sends one JSON object per text frame with the shape
//! `{"category": "<family>", "event": "<name>", "data": ...}`. Older
//! servers name the category field `type`; both are accepted.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mangaforge_core::events::CATEGORY_SYSTEM;

/// A decoded inbound message tagged with its category and event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event family, e.g. `generation` or `export`.
    #[serde(alias = "type")]
    pub category: String,
    /// Event name within the family, e.g. `progress`.
    pub event: String,
    /// Family-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(
        category: impl Into<String>,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            category: category.into(),
            event: event.into(),
            data,
        }
    }

    /// An envelope in the reserved `system` category, synthesised locally.
    pub fn system(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self::new(CATEGORY_SYSTEM, event, data)
    }

    /// Decode the payload into the family's concrete type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Errors produced while decoding a push frame.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame has an empty category or event name")]
    MissingName,

    /// Only the connection manager may produce `system` envelopes.
    #[error("Frame uses the reserved 'system' category")]
    ReservedCategory,
}

/// Parse a text frame into an [`Envelope`].
///
/// Callers should log failures and keep the channel running.
pub fn parse_envelope(text: &str) -> Result<Envelope, EnvelopeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if envelope.category.is_empty() || envelope.event.is_empty() {
        return Err(EnvelopeError::MissingName);
    }
    if envelope.category == CATEGORY_SYSTEM {
        return Err(EnvelopeError::ReservedCategory);
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parse_category_frame() {
        let json = r#"{"category":"generation","event":"progress","data":{"taskId":"t-1","progress":40}}"#;
        let envelope = parse_envelope(json).unwrap();
        assert_eq!(envelope.category, "generation");
        assert_eq!(envelope.event, "progress");
        assert_eq!(envelope.data["progress"], 40);
    }

    #[test]
    fn parse_legacy_type_field() {
        let json = r#"{"type":"export","event":"done","data":null}"#;
        let envelope = parse_envelope(json).unwrap();
        assert_eq!(envelope.category, "export");
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let envelope = parse_envelope(r#"{"category":"notification","event":"ping"}"#).unwrap();
        assert!(envelope.data.is_null());
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert_matches!(parse_envelope("not json at all"), Err(EnvelopeError::Json(_)));
    }

    #[test]
    fn missing_event_is_rejected() {
        assert_matches!(
            parse_envelope(r#"{"category":"generation","data":{}}"#),
            Err(EnvelopeError::Json(_))
        );
        assert_matches!(
            parse_envelope(r#"{"category":"","event":"progress"}"#),
            Err(EnvelopeError::MissingName)
        );
    }

    #[test]
    fn server_cannot_spoof_system_events() {
        assert_matches!(
            parse_envelope(r#"{"category":"system","event":"reconnect_failed"}"#),
            Err(EnvelopeError::ReservedCategory)
        );
    }

    #[test]
    fn decode_data_into_typed_payload() {
        #[derive(Deserialize)]
        struct Progress {
            progress: u8,
        }
        let envelope = Envelope::new("generation", "progress", serde_json::json!({"progress": 7}));
        let payload: Progress = envelope.decode_data().unwrap();
        assert_eq!(payload.progress, 7);
    }
}
