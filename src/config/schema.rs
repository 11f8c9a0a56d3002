use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling server connection
    pub signaling: SignalingConfig,
    /// STUN/TURN servers
    pub ice: IceConfig,
    /// Local media and bitrate settings
    pub media: MediaConfig,
    /// Statistics sampling
    pub stats: StatsConfig,
    /// Connection failure recovery
    pub recovery: RecoveryConfig,
    /// SDP/ICE negotiation limits
    pub negotiation: NegotiationConfig,
}

/// Signaling channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
    /// Fixed delay between reconnect attempts (ms)
    pub reconnect_delay_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/signaling".to_string(),
            reconnect_delay_ms: 3000,
        }
    }
}

/// One STUN or TURN server entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceServerConfig {
    /// Server URLs (e.g. ["stun:stun.l.google.com:19302"] or
    /// ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:3478?transport=tcp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Create a STUN entry with a single URL
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Whether any URL is a TURN relay
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    /// Whether any URL is a STUN server
    pub fn is_stun(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
    }

    pub fn has_credentials(&self) -> bool {
        matches!(
            (&self.username, &self.credential),
            (Some(u), Some(c)) if !u.is_empty() && !c.is_empty()
        )
    }
}

/// ICE configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IceConfig {
    /// STUN/TURN servers. TURN credentials are injected at runtime by a
    /// `CredentialProvider` and should not be stored here.
    pub servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServerConfig::stun("stun:stun.l.google.com:19302")],
        }
    }
}

/// Media configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Bitrate cap applied to each video sender (kbps)
    pub max_video_bitrate_kbps: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_video_bitrate_kbps: 2500,
        }
    }
}

impl MediaConfig {
    pub fn max_video_bitrate_bps(&self) -> u64 {
        self.max_video_bitrate_kbps as u64 * 1000
    }
}

/// Statistics sampling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatsConfig {
    /// Sampling interval (ms)
    pub interval_ms: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// ICE restarts allowed per failure episode before the session fails
    /// (0 = unbounded)
    pub max_ice_restarts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_ice_restarts: 5,
        }
    }
}

/// Negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Remote candidates buffered while no remote description is set
    pub max_pending_candidates: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_pending_candidates: 64,
        }
    }
}
