use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::secrets::CredentialProvider;
use super::{AppConfig, IceServerConfig};
use crate::error::{AppError, Result};

impl AppConfig {
    /// Load configuration from a JSON file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => {
                debug!("No configuration file given, using defaults");
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(text)
            .map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let url = &self.signaling.url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::Config(format!(
                "signaling.url must be a ws:// or wss:// URL, got '{}'",
                url
            )));
        }
        if self.signaling.reconnect_delay_ms == 0 {
            return Err(AppError::Config(
                "signaling.reconnect_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.stats.interval_ms == 0 {
            return Err(AppError::Config(
                "stats.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.media.max_video_bitrate_kbps == 0 {
            return Err(AppError::Config(
                "media.max_video_bitrate_kbps must be greater than 0".to_string(),
            ));
        }
        for server in &self.ice.servers {
            if server.urls.is_empty() {
                return Err(AppError::Config("ICE server entry has no urls".to_string()));
            }
            if !server.is_stun() && !server.is_turn() {
                return Err(AppError::Config(format!(
                    "Unsupported ICE server url: {}",
                    server.urls.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Final ICE server list for the process lifetime
    ///
    /// TURN entries without credentials are filled from `provider`. Entries
    /// that remain without credentials are kept; the peer backend skips them.
    pub fn resolve_ice_servers(&self, provider: &dyn CredentialProvider) -> Arc<[IceServerConfig]> {
        self.ice
            .servers
            .iter()
            .map(|server| {
                let mut server = server.clone();
                if server.is_turn() && !server.has_credentials() {
                    let first = server.urls.first().cloned().unwrap_or_default();
                    match provider.turn_credentials(&first) {
                        Some(creds) => {
                            server.username = Some(creds.username);
                            server.credential = Some(creds.credential);
                        }
                        None => warn!("No TURN credentials available for {}", first),
                    }
                }
                server
            })
            .collect()
    }
}
