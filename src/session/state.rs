//! Session lifecycle state machine

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Lifecycle state of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    /// Broadcaster set up, waiting for negotiation and transport
    Publishing,
    /// Viewer joined, waiting for negotiation and transport
    Viewing,
    Connected,
    /// Transport failed; ICE restart in progress on the same connection
    Reconnecting,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Publishing => "publishing",
            Self::Viewing => "viewing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }

    /// A session exists and owns a connection
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Publishing | Self::Viewing | Self::Connected | Self::Reconnecting
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Apply `trigger`; illegal pairs are rejected
    pub fn next(self, trigger: Trigger) -> Result<SessionState> {
        use SessionState::*;
        use Trigger::*;

        let to = match (self, trigger) {
            (Idle | Closed | Failed, Reset) => Idle,
            (Idle, Publish) => Publishing,
            (Idle, View) => Viewing,
            (Publishing | Viewing | Reconnecting, TransportUp) => Connected,
            (Connected, TransportFailed) => Reconnecting,
            (Reconnecting, TransportFailed) => Reconnecting,
            (Publishing | Viewing | Connected | Reconnecting, Close) => Closed,
            (Closed, Close) => Closed,
            (Publishing | Viewing | Connected | Reconnecting, Fail) => Failed,
            (from, trigger) => {
                return Err(AppError::InvalidTransition {
                    from: from.to_string(),
                    trigger: trigger.to_string(),
                })
            }
        };
        Ok(to)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What moves the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Start over after a previous session ended
    Reset,
    Publish,
    View,
    /// Negotiated and the connection reports `connected`
    TransportUp,
    /// The connection reports `failed`
    TransportFailed,
    Close,
    /// Unrecoverable error
    Fail,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Trigger::Reset => "reset",
            Trigger::Publish => "publish",
            Trigger::View => "view",
            Trigger::TransportUp => "transport-up",
            Trigger::TransportFailed => "transport-failed",
            Trigger::Close => "close",
            Trigger::Fail => "fail",
        };
        f.write_str(name)
    }
}

/// Which side of the stream this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Broadcaster,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Broadcaster => write!(f, "broadcaster"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}
