//! Session event types
//!
//! Defines every event the session manager publishes through the event bus.
//! The set is closed: consumers match on [`SessionEvent`] or register for an
//! [`EventKind`], never on free-form strings.

use serde::{Deserialize, Serialize};

use crate::peer::{ConnectionState, IceConnectionState, RemoteTrackInfo};
use crate::session::SessionState;
use crate::stats::ConnectionStats;

/// Session event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`:
/// ```json
/// {
///   "event": "connection-failed",
///   "data": { "stream_id": "room42", "attempt": 1 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ============================================================================
    // Signaling Channel Events
    // ============================================================================
    /// Signaling socket is open
    #[serde(rename = "signaling-connected")]
    SignalingConnected {
        /// Signaling server URL
        url: String,
    },

    /// Signaling socket closed; a reconnect is scheduled
    #[serde(rename = "signaling-disconnected")]
    SignalingDisconnected {
        url: String,
        /// Close reason, if the server sent one
        reason: Option<String>,
    },

    /// Socket-level error, undecodable frame, or a message dropped while closed
    #[serde(rename = "signaling-error")]
    SignalingError { message: String },

    // ============================================================================
    // Session Lifecycle Events
    // ============================================================================
    /// Broadcaster session created (state `publishing`)
    #[serde(rename = "streaming-started")]
    StreamingStarted { stream_id: String },

    /// Broadcaster session torn down
    #[serde(rename = "streaming-stopped")]
    StreamingStopped { stream_id: String },

    /// Viewer session created (state `viewing`)
    #[serde(rename = "stream-joined")]
    StreamJoined { stream_id: String, viewer_id: String },

    /// Viewer session torn down
    #[serde(rename = "stream-left")]
    StreamLeft { stream_id: String, viewer_id: String },

    /// Session state machine moved
    #[serde(rename = "session-state-change")]
    SessionStateChange {
        stream_id: String,
        from: SessionState,
        to: SessionState,
    },

    // ============================================================================
    // Peer Connection Events
    // ============================================================================
    /// Inbound media track arrived
    #[serde(rename = "remote-stream")]
    RemoteStream {
        stream_id: String,
        track: RemoteTrackInfo,
    },

    #[serde(rename = "connection-state-change")]
    ConnectionStateChange {
        stream_id: String,
        state: ConnectionState,
    },

    #[serde(rename = "ice-connection-state-change")]
    IceConnectionStateChange {
        stream_id: String,
        state: IceConnectionState,
    },

    /// Periodic statistics sample
    #[serde(rename = "stats-update")]
    StatsUpdate {
        stream_id: String,
        stats: ConnectionStats,
    },

    /// Connection reported `failed`; an ICE restart was issued
    #[serde(rename = "connection-failed")]
    ConnectionFailed {
        stream_id: String,
        /// Restart attempt number (1-based)
        attempt: u32,
    },

    /// Typed error observed in the background or returned from an operation
    #[serde(rename = "streaming-error")]
    StreamingError {
        #[serde(skip_serializing_if = "Option::is_none")]
        stream_id: Option<String>,
        /// Error category (see `AppError::kind`)
        kind: String,
        message: String,
    },

    // ============================================================================
    // Server Notifications
    // ============================================================================
    #[serde(rename = "stream-started")]
    StreamStarted { stream_id: String },

    #[serde(rename = "stream-ended")]
    StreamEnded { stream_id: String },

    #[serde(rename = "viewer-joined")]
    ViewerJoined {
        stream_id: String,
        viewer_id: Option<String>,
    },

    #[serde(rename = "viewer-left")]
    ViewerLeft {
        stream_id: String,
        viewer_id: Option<String>,
    },
}

/// Event kind, one per [`SessionEvent`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SignalingConnected,
    SignalingDisconnected,
    SignalingError,
    StreamingStarted,
    StreamingStopped,
    StreamJoined,
    StreamLeft,
    SessionStateChange,
    RemoteStream,
    ConnectionStateChange,
    IceConnectionStateChange,
    StatsUpdate,
    ConnectionFailed,
    StreamingError,
    StreamStarted,
    StreamEnded,
    ViewerJoined,
    ViewerLeft,
}

impl EventKind {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignalingConnected => "signaling-connected",
            Self::SignalingDisconnected => "signaling-disconnected",
            Self::SignalingError => "signaling-error",
            Self::StreamingStarted => "streaming-started",
            Self::StreamingStopped => "streaming-stopped",
            Self::StreamJoined => "stream-joined",
            Self::StreamLeft => "stream-left",
            Self::SessionStateChange => "session-state-change",
            Self::RemoteStream => "remote-stream",
            Self::ConnectionStateChange => "connection-state-change",
            Self::IceConnectionStateChange => "ice-connection-state-change",
            Self::StatsUpdate => "stats-update",
            Self::ConnectionFailed => "connection-failed",
            Self::StreamingError => "streaming-error",
            Self::StreamStarted => "stream-started",
            Self::StreamEnded => "stream-ended",
            Self::ViewerJoined => "viewer-joined",
            Self::ViewerLeft => "viewer-left",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SessionEvent {
    /// Get the event kind (for handler routing)
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SignalingConnected { .. } => EventKind::SignalingConnected,
            Self::SignalingDisconnected { .. } => EventKind::SignalingDisconnected,
            Self::SignalingError { .. } => EventKind::SignalingError,
            Self::StreamingStarted { .. } => EventKind::StreamingStarted,
            Self::StreamingStopped { .. } => EventKind::StreamingStopped,
            Self::StreamJoined { .. } => EventKind::StreamJoined,
            Self::StreamLeft { .. } => EventKind::StreamLeft,
            Self::SessionStateChange { .. } => EventKind::SessionStateChange,
            Self::RemoteStream { .. } => EventKind::RemoteStream,
            Self::ConnectionStateChange { .. } => EventKind::ConnectionStateChange,
            Self::IceConnectionStateChange { .. } => EventKind::IceConnectionStateChange,
            Self::StatsUpdate { .. } => EventKind::StatsUpdate,
            Self::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            Self::StreamingError { .. } => EventKind::StreamingError,
            Self::StreamStarted { .. } => EventKind::StreamStarted,
            Self::StreamEnded { .. } => EventKind::StreamEnded,
            Self::ViewerJoined { .. } => EventKind::ViewerJoined,
            Self::ViewerLeft { .. } => EventKind::ViewerLeft,
        }
    }

    /// Get the event name
    pub fn event_name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Build a `streaming-error` event from an application error
    pub fn error(stream_id: Option<&str>, err: &crate::error::AppError) -> Self {
        Self::StreamingError {
            stream_id: stream_id.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_event_name_matches_serde_tag() {
        let event = SessionEvent::ConnectionFailed {
            stream_id: "room42".to_string(),
            attempt: 1,
        };
        assert_eq!(event.event_name(), "connection-failed");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "connection-failed");
        assert_eq!(json["data"]["attempt"], 1);
    }

    #[test]
    fn test_state_change_serialization() {
        let event = SessionEvent::SessionStateChange {
            stream_id: "room42".to_string(),
            from: SessionState::Publishing,
            to: SessionState::Connected,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("session-state-change"));
        assert!(json.contains("\"publishing\""));

        let deserialized: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.kind(), EventKind::SessionStateChange);
    }

    #[test]
    fn test_error_event() {
        let err = AppError::Negotiation("missing m-line".to_string());
        match SessionEvent::error(Some("room42"), &err) {
            SessionEvent::StreamingError {
                stream_id,
                kind,
                message,
            } => {
                assert_eq!(stream_id.as_deref(), Some("room42"));
                assert_eq!(kind, "negotiation");
                assert!(message.contains("missing m-line"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
