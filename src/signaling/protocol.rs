//! Signaling wire protocol
//!
//! One JSON text frame per message, discriminated by `type`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::media::MediaConstraints;
use crate::peer::SessionDescription;

/// Signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Broadcaster announces a stream
    StartStreaming {
        stream_id: String,
        #[serde(default)]
        constraints: MediaConstraints,
    },
    /// Broadcaster ends a stream
    StopStreaming { stream_id: String },
    /// Viewer asks to join a stream
    JoinStream { stream_id: String, viewer_id: String },
    /// Viewer leaves a stream
    LeaveStream { stream_id: String, viewer_id: String },
    /// SDP offer relayed by the server
    Offer {
        stream_id: String,
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
    },
    /// SDP answer
    Answer {
        stream_id: String,
        answer: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
    },
    /// Trickled ICE candidate
    IceCandidate {
        stream_id: String,
        candidate: crate::peer::IceCandidate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
    },
    StreamStarted { stream_id: String },
    StreamEnded { stream_id: String },
    ViewerJoined {
        stream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
    },
    ViewerLeft {
        stream_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        viewer_id: Option<String>,
    },
    /// Server-side error
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        error: String,
    },
}

impl SignalingMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire `type` value
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StartStreaming { .. } => "start-streaming",
            Self::StopStreaming { .. } => "stop-streaming",
            Self::JoinStream { .. } => "join-stream",
            Self::LeaveStream { .. } => "leave-stream",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::StreamStarted { .. } => "stream-started",
            Self::StreamEnded { .. } => "stream-ended",
            Self::ViewerJoined { .. } => "viewer-joined",
            Self::ViewerLeft { .. } => "viewer-left",
            Self::Error { .. } => "error",
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Self::StartStreaming { stream_id, .. }
            | Self::StopStreaming { stream_id }
            | Self::JoinStream { stream_id, .. }
            | Self::LeaveStream { stream_id, .. }
            | Self::Offer { stream_id, .. }
            | Self::Answer { stream_id, .. }
            | Self::IceCandidate { stream_id, .. }
            | Self::StreamStarted { stream_id }
            | Self::StreamEnded { stream_id }
            | Self::ViewerJoined { stream_id, .. }
            | Self::ViewerLeft { stream_id, .. } => Some(stream_id),
            Self::Error { stream_id, .. } => stream_id.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{IceCandidate, SdpType};
    use serde_json::json;

    #[test]
    fn test_start_streaming_wire_shape() {
        let msg = SignalingMessage::StartStreaming {
            stream_id: "room42".to_string(),
            constraints: MediaConstraints::video_only(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "start-streaming");
        assert_eq!(value["stream_id"], "room42");
        assert_eq!(value["constraints"]["video"]["height"]["ideal"], 720);
        assert_eq!(msg.type_name(), "start-streaming");
    }

    #[test]
    fn test_decode_offer_from_server() {
        let text = json!({
            "type": "offer",
            "stream_id": "room42",
            "offer": {"type": "offer", "sdp": "v=0\r\n"},
            "viewer_id": "v-1"
        })
        .to_string();
        let msg = SignalingMessage::from_json(&text).unwrap();
        match &msg {
            SignalingMessage::Offer {
                stream_id,
                offer,
                viewer_id,
            } => {
                assert_eq!(stream_id, "room42");
                assert_eq!(offer.sdp_type, SdpType::Offer);
                assert_eq!(viewer_id.as_deref(), Some("v-1"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(msg.stream_id(), Some("room42"));
    }

    #[test]
    fn test_candidate_and_optional_fields() {
        let msg = SignalingMessage::IceCandidate {
            stream_id: "room42".to_string(),
            candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host").with_mid("0", 0),
            viewer_id: None,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert!(value.get("viewer_id").is_none());

        let joined = SignalingMessage::from_json(r#"{"type":"viewer-joined","stream_id":"room42"}"#).unwrap();
        assert_eq!(
            joined,
            SignalingMessage::ViewerJoined {
                stream_id: "room42".to_string(),
                viewer_id: None
            }
        );
    }

    #[test]
    fn test_error_without_stream() {
        let msg = SignalingMessage::from_json(r#"{"type":"error","error":"no such stream"}"#).unwrap();
        assert_eq!(msg.stream_id(), None);
        assert_eq!(msg.type_name(), "error");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SignalingMessage::from_json(r#"{"type":"bogus","stream_id":"x"}"#).unwrap_err();
        assert_eq!(err.kind(), "serialization");
        assert!(SignalingMessage::from_json("not json").is_err());
    }
}
