//! Configuration loading, validation, and env substitution.
//!
//! Config files: `feedlink.toml`, `feedlink.yaml`, or `feedlink.json`
//! Searched in `./` then `~/.config/feedlink/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, discover_and_load, find_or_default_config_path, load_config,
        save_config, set_config_dir,
    },
    schema::{
        CredentialsConfig, EngineEntry, FeedlinkConfig, LinkConfig, MessagingConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
