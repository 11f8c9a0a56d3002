use thiserror::Error;

use crate::media::MediaError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Illegal transition from {from} on {trigger}")]
    InvalidTransition { from: String, trigger: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}

impl AppError {
    /// Short machine-readable category, used in `streaming-error` payloads
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MediaAcquisition(_) => "media_acquisition",
            Self::Signaling(_) => "signaling",
            Self::Negotiation(_) => "negotiation",
            Self::ConnectionFailure(_) => "connection_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::InvalidOperation(_) => "invalid_operation",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::WebRtc(_) => "webrtc",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = AppError::Negotiation("bad sdp".to_string());
        assert_eq!(err.kind(), "negotiation");
        assert_eq!(err.to_string(), "Negotiation error: bad sdp");

        let err: AppError = MediaError::DeviceBusy.into();
        assert_eq!(err.kind(), "media_acquisition");
    }
}
