//! Configuration validation.
//!
//! Checks a loaded [`FeedlinkConfig`] for values that would make the
//! messaging client or the linking handshake fail later at runtime.

use std::collections::HashSet;

use {secrecy::ExposeSecret, url::Url};

use crate::schema::FeedlinkConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "link.origin"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: impl Into<String>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a loaded configuration.
#[must_use]
pub fn validate(config: &FeedlinkConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.messaging.instance.trim().is_empty() {
        result.push(
            Severity::Error,
            "messaging.instance",
            "installation name must not be empty",
        );
    }

    let secret_missing = config
        .messaging
        .api_key_secret
        .as_ref()
        .is_none_or(|s| s.expose_secret().is_empty());
    if config.messaging.api_key_id.is_empty() || secret_missing {
        result.push(
            Severity::Warning,
            "messaging.api_key_id",
            "API key id/secret not set; the messaging service will reject the client",
        );
    }

    match Url::parse(&config.link.origin) {
        Ok(url) if url.cannot_be_a_base() => result.push(
            Severity::Error,
            "link.origin",
            format!("'{}' cannot be used as a base URL", config.link.origin),
        ),
        Ok(_) => {},
        Err(e) => result.push(
            Severity::Error,
            "link.origin",
            format!("'{}' is not an absolute URL: {e}", config.link.origin),
        ),
    }

    if !config.link.callback_path.starts_with('/') {
        result.push(
            Severity::Error,
            "link.callback_path",
            "callback path must start with '/'",
        );
    }

    if config.link.scopes.is_empty() {
        result.push(
            Severity::Warning,
            "link.scopes",
            "no capability scopes requested",
        );
    }

    let mut users = HashSet::new();
    let mut feeds = HashSet::new();
    for (idx, entry) in config.engines.iter().enumerate() {
        if !users.insert(entry.user_id.as_str()) {
            result.push(
                Severity::Error,
                format!("engines[{idx}].user_id"),
                format!("user '{}' is registered more than once", entry.user_id),
            );
        }
        if !feeds.insert(entry.feed_id.as_str()) {
            result.push(
                Severity::Error,
                format!("engines[{idx}].feed_id"),
                format!("feed '{}' is bound to more than one user", entry.feed_id),
            );
        }
    }

    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::schema::{EngineEntry, LinkConfig},
        secrecy::Secret,
    };

    fn keyed() -> FeedlinkConfig {
        let mut cfg = FeedlinkConfig::default();
        cfg.messaging.api_key_id = "id".into();
        cfg.messaging.api_key_secret = Some(Secret::new("secret".into()));
        cfg
    }

    #[test]
    fn keyed_defaults_are_clean() {
        let result = validate(&keyed());
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn missing_api_key_is_a_warning() {
        let result = validate(&FeedlinkConfig::default());
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn bad_link_settings_are_errors() {
        let mut cfg = keyed();
        cfg.link = LinkConfig {
            origin: "localhost".into(),
            callback_path: "callback".into(),
            scopes: vec![],
            ..LinkConfig::default()
        };
        let result = validate(&cfg);
        assert_eq!(result.count(Severity::Error), 2);
        assert_eq!(result.count(Severity::Warning), 1);
        assert!(result.diagnostics.iter().any(|d| d.path == "link.origin"));
    }

    #[test]
    fn duplicate_users_are_rejected() {
        let mut cfg = keyed();
        cfg.engines = vec![
            EngineEntry {
                user_id: "u1".into(),
                feed_id: "F1".into(),
            },
            EngineEntry {
                user_id: "u1".into(),
                feed_id: "F2".into(),
            },
        ];
        let result = validate(&cfg);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "engines[1].user_id");
    }

    #[test]
    fn shared_feeds_are_rejected() {
        let mut cfg = keyed();
        cfg.engines = vec![
            EngineEntry {
                user_id: "u1".into(),
                feed_id: "F1".into(),
            },
            EngineEntry {
                user_id: "u2".into(),
                feed_id: "F1".into(),
            },
        ];
        let result = validate(&cfg);
        assert_eq!(result.count(Severity::Error), 1);
        assert_eq!(result.diagnostics[0].path, "engines[1].feed_id");
    }
}
