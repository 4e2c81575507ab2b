//! Capability interfaces between a binding and a user's automation engine.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait};

/// The assistant endpoint of one user's engine.
#[async_trait]
pub trait AssistantEngine: Send + Sync {
    /// Interpret one inbound command.
    async fn handle_command(&self, text: &str) -> Result<()>;

    /// Install or clear the channel the engine replies through.
    async fn set_receiver(&self, receiver: Option<Arc<dyn AssistantReceiver>>) -> Result<()>;
}

/// Outbound channel handed to an engine.
#[async_trait]
pub trait AssistantReceiver: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}
