use std::sync::Arc;

use {
    anyhow::{Result, bail},
    feedlink_assistant::{AssistantManager, LinkState, ManagerOptions},
    feedlink_config::{FeedlinkConfig, Severity, validate},
    feedlink_messaging::{
        CredentialStore, FileCredentialStore, has_credentials, memory::MemoryBackend,
    },
    tracing::{info, warn},
};

use crate::echo::EchoEngine;

/// Build a manager over the loopback backend and the configured credential file.
pub fn build_manager(config: &FeedlinkConfig, backend: &MemoryBackend) -> Result<AssistantManager> {
    let path = config.credentials.resolved_path();
    let storage: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::open(&path));
    let options = ManagerOptions::from_config(config)?;
    Ok(AssistantManager::new(
        Arc::new(backend.clone()),
        storage,
        options,
    )?)
}

/// Load config and report validation problems. Errors abort.
pub fn load_checked() -> Result<FeedlinkConfig> {
    let config = feedlink_config::discover_and_load();
    let result = validate(&config);
    for d in &result.diagnostics {
        match d.severity {
            Severity::Error => warn!(path = %d.path, "config error: {}", d.message),
            Severity::Warning => warn!(path = %d.path, "config warning: {}", d.message),
        }
    }
    if result.has_errors() {
        bail!(
            "configuration has {} error(s); run `feedlink config check`",
            result.count(Severity::Error)
        );
    }
    Ok(config)
}

/// Seed the loopback service with the local account and the configured feeds.
///
/// The in-process backend starts empty on every run.
fn seed_loopback(config: &FeedlinkConfig, backend: &MemoryBackend) {
    let own = backend.own_account(&config.messaging.instance);
    for entry in &config.engines {
        backend.add_feed(entry.feed_id.as_str(), &[own.as_str(), entry.user_id.as_str()]);
    }
}

pub async fn run() -> Result<()> {
    let config = load_checked()?;
    let backend = MemoryBackend::new();
    seed_loopback(&config, &backend);
    let manager = build_manager(&config, &backend)?;

    if manager.state() == LinkState::NoCredentials {
        bail!("no messaging account linked; run `feedlink link` first");
    }

    for entry in &config.engines {
        let engine = Arc::new(EchoEngine::new(entry.user_id.clone()));
        manager
            .add_engine(entry.user_id.clone(), engine, entry.feed_id.clone())
            .await?;
    }

    manager.start().await?;
    let active = manager
        .registered_users()
        .iter()
        .filter(|user| manager.has_active_binding(user))
        .count();
    info!(
        engines = config.engines.len(),
        active, "feedlink running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    manager.stop().await;
    Ok(())
}

pub fn status() -> Result<()> {
    let config = feedlink_config::discover_and_load();
    let path = config.credentials.resolved_path();
    let store = FileCredentialStore::open(&path);

    if has_credentials(&store) {
        println!("Linked:      yes");
    } else {
        println!("Linked:      no (run `feedlink link`)");
    }
    println!("Credentials: {}", path.display());
    println!("Instance:    {}", config.messaging.instance);
    match config.link.return_url() {
        Ok(url) => println!("Callback:    {url}"),
        Err(e) => println!("Callback:    invalid ({e})"),
    }

    if config.engines.is_empty() {
        println!("Engines:     none configured");
    } else {
        println!("Engines:");
        for entry in &config.engines {
            println!("  {} -> feed {}", entry.user_id, entry.feed_id);
        }
    }
    Ok(())
}

pub async fn unlink() -> Result<()> {
    let config = feedlink_config::discover_and_load();
    let backend = MemoryBackend::new();
    let manager = build_manager(&config, &backend)?;
    if manager.state() == LinkState::NoCredentials {
        println!("No messaging account linked.");
        return Ok(());
    }
    manager.unlink().await?;
    println!("Messaging account unlinked.");
    Ok(())
}
