//! Config schema types (messaging client, linking handshake, credentials, engines).

use std::path::PathBuf;

use {
    feedlink_common::{FeedId, UserId},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    url::Url,
};

use crate::{Error, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedlinkConfig {
    pub messaging: MessagingConfig,
    pub link: LinkConfig,
    pub credentials: CredentialsConfig,
    /// Users whose engines are bound to a feed at start-up.
    pub engines: Vec<EngineEntry>,
}

/// Options for constructing the shared messaging client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Installation name presented to the messaging service.
    pub instance: String,
    pub api_key_id: String,
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key_secret: Option<Secret<String>>,
    /// Replicate the object store continuously once enabled.
    pub sync: bool,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            instance: "assistant".into(),
            api_key_id: String::new(),
            api_key_secret: None,
            sync: true,
        }
    }
}

/// Linking handshake settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Public origin the authorization page redirects back to.
    pub origin: String,
    pub callback_path: String,
    /// Capability scopes requested from the auth API.
    pub scopes: Vec<String>,
    /// How long the CLI waits for the browser callback.
    pub callback_timeout_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".into(),
            callback_path: "/assistant/setup/callback".into(),
            scopes: vec!["PublicProfile".into(), "OmletChat".into()],
            callback_timeout_secs: 300,
        }
    }
}

impl LinkConfig {
    /// Full return address handed to the authorization page.
    pub fn return_url(&self) -> Result<Url> {
        let origin = Url::parse(&self.origin)
            .map_err(|e| Error::message(format!("invalid link.origin '{}': {e}", self.origin)))?;
        origin.join(&self.callback_path).map_err(|e| {
            Error::message(format!(
                "invalid link.callback_path '{}': {e}",
                self.callback_path
            ))
        })
    }
}

/// Where the messaging credentials are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub path: Option<PathBuf>,
}

impl CredentialsConfig {
    /// Configured path, or `credentials.json` in the config directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            crate::loader::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("credentials.json")
        })
    }
}

/// A user whose engine should be bound to a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineEntry {
    pub user_id: UserId,
    pub feed_id: FeedId,
}

// ── Serde helpers for Secret<String> ────────────────────────────────────────

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
