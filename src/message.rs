//! # Control Message Protocol
//!
//! JSON control messages exchanged between client, relay, and the upstream
//! AI service. Control messages travel as whole WebSocket text frames and are
//! never fragmented; binary audio frames use a separate framing path and are
//! never wrapped in this envelope.
//!
//! ## Wire Format:
//! Every message is a JSON object with a `type` tag and an optional payload:
//! - `{"type":"system","message":"AI service connected"}`
//! - `{"type":"transcription","text":"hello there"}`
//! - `{"type":"stop_recording"}`
//!
//! Unknown fields are ignored so the upstream service can extend its payloads
//! without breaking older clients. Unknown `type` tags are a parse error and
//! the frame is dropped by the receiver.

use serde::{Deserialize, Serialize};

/// Control messages understood by every party in the pipeline.
///
/// The relay synthesizes `system` and `error` messages itself; everything
/// else is produced by the upstream service or the client and forwarded
/// verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Service-level notice (e.g. the relay reporting its upstream link)
    #[serde(rename = "system")]
    System {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Something went wrong; the payload is a human-readable description
    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Connection or processing status updates
    #[serde(rename = "status")]
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Speech-to-text result for the most recent utterance
    #[serde(rename = "transcription")]
    Transcription {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Generated assistant response text
    #[serde(rename = "ai_response")]
    AiResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Client signal that the current utterance is complete
    #[serde(rename = "stop_recording")]
    StopRecording {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Client signal that the assistant should stop responding
    #[serde(rename = "interrupt")]
    Interrupt {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

impl ControlMessage {
    /// Synthesized `system` notice, as the relay sends when its upstream
    /// connection opens.
    pub fn system(message: impl Into<String>) -> Self {
        ControlMessage::System {
            message: Some(message.into()),
            timestamp: None,
        }
    }

    /// Synthesized `error` notice, as the relay sends when the upstream
    /// service is unavailable.
    pub fn error(message: impl Into<String>) -> Self {
        ControlMessage::Error {
            message: Some(message.into()),
            timestamp: None,
        }
    }

    /// Client-originated end-of-utterance signal.
    pub fn stop_recording() -> Self {
        ControlMessage::StopRecording { timestamp: None }
    }

    /// Parse a text frame into a control message.
    ///
    /// Callers treat a failure here as a dropped frame, not a fatal error:
    /// the connection stays open.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for the wire. Serialization of these variants cannot fail,
    /// so this returns the JSON directly.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("control message serializes")
    }

    /// Machine-readable tag for logging and routing.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::System { .. } => "system",
            ControlMessage::Error { .. } => "error",
            ControlMessage::Status { .. } => "status",
            ControlMessage::Transcription { .. } => "transcription",
            ControlMessage::AiResponse { .. } => "ai_response",
            ControlMessage::StopRecording { .. } => "stop_recording",
            ControlMessage::Interrupt { .. } => "interrupt",
        }
    }
}

/// A control message as it entered the client's message log: the parsed
/// payload plus the local arrival timestamp (milliseconds since the epoch).
///
/// Arrival order in the log matches frame arrival order on the transport.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoggedMessage {
    pub message: ControlMessage,
    pub received_at: i64,
}

impl LoggedMessage {
    /// Stamp `message` with the current local time.
    pub fn received(message: ControlMessage) -> Self {
        Self {
            message,
            received_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_message_round_trip() {
        let msg = ControlMessage::system("AI service connected");
        let json = msg.to_json();
        assert!(json.contains(r#""type":"system""#));
        assert!(json.contains("AI service connected"));

        let parsed = ControlMessage::parse(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_upstream_ready_message_parses() {
        // The exact shape the upstream service sends after a session resumes.
        let parsed = ControlMessage::parse(r#"{"type":"system","message":"ready"}"#).unwrap();
        match parsed {
            ControlMessage::System { message, timestamp } => {
                assert_eq!(message.as_deref(), Some("ready"));
                assert_eq!(timestamp, None);
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_payload_free_variants() {
        let json = ControlMessage::stop_recording().to_json();
        assert_eq!(json, r#"{"type":"stop_recording"}"#);

        let parsed = ControlMessage::parse(r#"{"type":"interrupt"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::Interrupt { timestamp: None });
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        // Upstream may decorate responses with extra metadata.
        let text = r#"{"type":"ai_response","text":"hi","has_sources":true,"source_type":"web"}"#;
        let parsed = ControlMessage::parse(text).unwrap();
        match parsed {
            ControlMessage::AiResponse { text, .. } => assert_eq!(text.as_deref(), Some("hi")),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        assert!(ControlMessage::parse(r#"{"type":"telemetry","message":"x"}"#).is_err());
        assert!(ControlMessage::parse("not json at all").is_err());
    }

    #[test]
    fn test_logged_message_carries_local_timestamp() {
        let before = chrono::Utc::now().timestamp_millis();
        let entry = LoggedMessage::received(ControlMessage::system("ready"));
        let after = chrono::Utc::now().timestamp_millis();

        assert!(entry.received_at >= before && entry.received_at <= after);
        assert_eq!(entry.message, ControlMessage::system("ready"));
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let msg = ControlMessage::error("AI service unavailable");
        assert_eq!(msg.kind(), "error");
        assert!(msg.to_json().contains(r#""type":"error""#));
    }
}
