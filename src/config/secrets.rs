//! Runtime credential injection for TURN servers
//!
//! TURN credentials are never compiled in or defaulted. They are looked up
//! when the ICE server list is resolved, once, at startup.

use std::collections::HashMap;

/// Environment variable holding the TURN username
pub const TURN_USERNAME_ENV: &str = "RTC_TURN_USERNAME";
/// Environment variable holding the TURN credential
pub const TURN_CREDENTIAL_ENV: &str = "RTC_TURN_CREDENTIAL";

/// TURN username/credential pair
#[derive(Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub username: String,
    pub credential: String,
}

impl std::fmt::Debug for TurnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentials")
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Source of TURN credentials
pub trait CredentialProvider: Send + Sync {
    /// Credentials for a TURN server identified by its first URL
    fn turn_credentials(&self, url: &str) -> Option<TurnCredentials>;
}

/// Reads `RTC_TURN_USERNAME` / `RTC_TURN_CREDENTIAL`
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn turn_credentials(&self, _url: &str) -> Option<TurnCredentials> {
        let username = std::env::var(TURN_USERNAME_ENV).ok()?;
        let credential = std::env::var(TURN_CREDENTIAL_ENV).ok()?;
        if username.is_empty() || credential.is_empty() {
            return None;
        }
        Some(TurnCredentials {
            username,
            credential,
        })
    }
}

/// Fixed credentials per TURN URL (injected by an embedding application)
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialProvider {
    entries: HashMap<String, TurnCredentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        self.entries.insert(
            url.into(),
            TurnCredentials {
                username: username.into(),
                credential: credential.into(),
            },
        );
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn turn_credentials(&self, url: &str) -> Option<TurnCredentials> {
        self.entries.get(url).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_provider_lookup() {
        let provider = StaticCredentialProvider::new().with("turn:relay.example.com:3478", "alice", "s3cret");
        let creds = provider.turn_credentials("turn:relay.example.com:3478").unwrap();
        assert_eq!(creds.username, "alice");
        assert!(provider.turn_credentials("turn:other.example.com").is_none());
    }

    #[test]
    fn test_debug_redacts_credential() {
        let creds = TurnCredentials {
            username: "alice".to_string(),
            credential: "s3cret".to_string(),
        };
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("s3cret"));
    }
}
