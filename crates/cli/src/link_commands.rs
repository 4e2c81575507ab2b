use std::{collections::HashMap, net::SocketAddr, time::Duration};

use {
    anyhow::{Context, Result},
    feedlink_assistant::LinkState,
    feedlink_messaging::memory::MemoryBackend,
    tracing::info,
    url::Url,
};

use crate::{
    assistant_commands::{build_manager, load_checked},
    callback_server::CallbackServer,
};

/// Loopback address the callback server binds for `return_url`.
fn callback_addr(return_url: &Url) -> Result<SocketAddr> {
    let port = return_url
        .port_or_known_default()
        .context("callback URL has no port")?;
    Ok(SocketAddr::from(([127, 0, 0, 1], port)))
}

pub async fn link(no_browser: bool) -> Result<()> {
    let config = load_checked()?;
    let backend = MemoryBackend::new();
    let manager = build_manager(&config, &backend)?;
    if manager.state() != LinkState::NoCredentials {
        println!("A messaging account is already linked; run `feedlink unlink` first.");
        return Ok(());
    }

    let return_url = manager.options().return_url.clone();
    let server = CallbackServer::bind(callback_addr(&return_url)?, return_url.path()).await?;

    let mut session: HashMap<String, String> = HashMap::new();
    let link = manager.begin_link(&mut session).await?;

    if no_browser {
        println!("Open this link to authorize feedlink:\n{link}");
    } else {
        println!("Opening browser for authorization...");
        if open::that(link.as_str()).is_err() {
            println!("Could not open browser. Please visit:\n{link}");
        }
    }

    println!("Waiting for callback on {return_url} ...");
    let timeout = Duration::from_secs(config.link.callback_timeout_secs);
    let query = server.wait(timeout).await?;

    manager.complete_link(&query, &mut session).await?;
    info!(state = ?manager.state(), "handshake complete");
    manager.stop().await;

    println!("Messaging account linked.");
    Ok(())
}
