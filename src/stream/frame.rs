//! Wire frames exchanged with the telephony media stream.
//!
//! Inbound text messages are decoded exactly once, here, into [`Frame`].
//! Outbound audio is serialized through [`OutboundMedia`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::StreamError;

/// One inbound control or media message.
///
/// ## Wire shape:
/// ```json
/// {"event": "connected"}
/// {"event": "start", "start": {"streamSid": "MZ..", "callSid": "CA..", "caller": "+1..", "called": "+1.."}}
/// {"event": "media", "streamSid": "MZ..", "media": {"payload": "<base64>"}}
/// {"event": "stop"}
/// ```
/// Any other event (`mark`, `dtmf`, ...) decodes to `Unknown`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Frame {
    Connected,
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        start: StartMetadata,
    },
    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        #[serde(rename = "sequenceNumber", default)]
        sequence_number: Option<String>,
        media: MediaPayload,
    },
    Stop,
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Decode a raw text message into a frame.
    pub fn parse(text: &str) -> Result<Self, StreamError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Frame::Connected => "connected",
            Frame::Start { .. } => "start",
            Frame::Media { .. } => "media",
            Frame::Stop => "stop",
            Frame::Unknown => "unknown",
        }
    }
}

/// Call metadata carried by the `start` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartMetadata {
    #[serde(rename = "streamSid", default)]
    pub stream_sid: Option<String>,
    #[serde(rename = "callSid", default)]
    pub call_sid: Option<String>,
    #[serde(alias = "from", default)]
    pub caller: Option<String>,
    #[serde(alias = "to", default)]
    pub called: Option<String>,
    #[serde(rename = "customParameters", default)]
    pub custom_parameters: HashMap<String, String>,
}

/// Audio carried by a `media` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    pub fn decode(&self) -> Result<Vec<u8>, StreamError> {
        Ok(STANDARD.decode(self.payload.as_bytes())?)
    }
}

/// Outbound `media` frame written back to the peer.
#[derive(Debug, Serialize)]
pub struct OutboundMedia<'a> {
    event: &'static str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
    media: OutboundPayload,
}

#[derive(Debug, Serialize)]
struct OutboundPayload {
    payload: String,
}

impl<'a> OutboundMedia<'a> {
    pub fn new(stream_sid: &'a str, audio: &[u8]) -> Self {
        Self {
            event: "media",
            stream_sid,
            media: OutboundPayload {
                payload: STANDARD.encode(audio),
            },
        }
    }

    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self)
            .map_err(|e| StreamError::Protocol(format!("Failed to encode frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_control_frames() {
        assert_eq!(Frame::parse(r#"{"event":"connected","protocol":"Call"}"#).unwrap(), Frame::Connected);
        assert_eq!(Frame::parse(r#"{"event":"stop","stop":{}}"#).unwrap(), Frame::Stop);
        assert_eq!(Frame::parse(r#"{"event":"mark","mark":{"name":"x"}}"#).unwrap(), Frame::Unknown);
    }

    #[test]
    fn test_parse_start_with_aliases() {
        let text = json!({
            "event": "start",
            "streamSid": "MZ-top",
            "start": {
                "streamSid": "MZ123",
                "callSid": "CA456",
                "from": "+15550001",
                "to": "+15550002",
                "customParameters": {"tenant": "acme"}
            }
        })
        .to_string();

        match Frame::parse(&text).unwrap() {
            Frame::Start { stream_sid, start } => {
                assert_eq!(stream_sid.as_deref(), Some("MZ-top"));
                assert_eq!(start.stream_sid.as_deref(), Some("MZ123"));
                assert_eq!(start.call_sid.as_deref(), Some("CA456"));
                assert_eq!(start.caller.as_deref(), Some("+15550001"));
                assert_eq!(start.called.as_deref(), Some("+15550002"));
                assert_eq!(start.custom_parameters["tenant"], "acme");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_media_payload_decodes() {
        let text = json!({
            "event": "media",
            "streamSid": "MZ123",
            "sequenceNumber": "4",
            "media": {"track": "inbound", "chunk": "3", "timestamp": "60", "payload": STANDARD.encode([1u8, 2, 3])}
        })
        .to_string();

        match Frame::parse(&text).unwrap() {
            Frame::Media { media, sequence_number, .. } => {
                assert_eq!(media.decode().unwrap(), vec![1, 2, 3]);
                assert_eq!(sequence_number.as_deref(), Some("4"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_protocol_errors() {
        assert!(matches!(Frame::parse("not json"), Err(StreamError::Protocol(_))));
        assert!(matches!(Frame::parse(r#"{"event":"media"}"#), Err(StreamError::Protocol(_))));

        let bad = MediaPayload {
            payload: "***".to_string(),
            track: None,
            chunk: None,
            timestamp: None,
        };
        assert!(matches!(bad.decode(), Err(StreamError::Protocol(_))));
    }

    #[test]
    fn test_outbound_media_shape() {
        let text = OutboundMedia::new("MZ123", &[0xFF, 0x7F]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ123");
        assert_eq!(value["media"]["payload"], STANDARD.encode([0xFFu8, 0x7F]));
    }
}
