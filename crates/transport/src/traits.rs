//! The transport capability and the JSON control-event vocabulary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use dhwani_core::AudioFrame;

use crate::TransportError;

/// Control events, JSON-tagged, flowing both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    // Server → client
    SessionInfo { session_id: String },
    Status { state: String, stage: String },
    Transcript { text: String, is_final: bool },
    Response { text: String },
    /// Base64 PCM fallback when the audio path is unavailable
    ResponseAudio { data: String },
    Error { message: String },
    Pong,
    // Client → server
    Text { content: String },
    Ping,
    EndSession,
}

/// The capability every transport exposes. One session per transport
/// instance; audio is canonical 16 kHz mono f32.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Ship one outbound audio frame to the client.
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), TransportError>;

    /// Next inbound audio frame, in capture order. `None` after close.
    async fn recv_audio(&self) -> Result<Option<AudioFrame>, TransportError>;

    async fn send_event(&self, event: &ControlEvent) -> Result<(), TransportError>;

    /// Next inbound control event. `None` after close.
    async fn recv_event(&self) -> Result<Option<ControlEvent>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_events_use_snake_case_tags() {
        let event = ControlEvent::Status {
            state: "speaking".to_string(),
            stage: "presentation".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"status\""));

        let event = ControlEvent::SessionInfo {
            session_id: "s1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"session_info\""));
    }

    #[test]
    fn control_event_roundtrip() {
        let events = vec![
            ControlEvent::Transcript {
                text: "नमस्ते".to_string(),
                is_final: false,
            },
            ControlEvent::Ping,
            ControlEvent::EndSession,
            ControlEvent::Text {
                content: "hello".to_string(),
            },
        ];
        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            let back: ControlEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(event, back);
        }
    }
}
