use std::sync::{Arc, Mutex};

use {
    anyhow::Result,
    async_trait::async_trait,
    feedlink_assistant::{AssistantEngine, AssistantReceiver},
    feedlink_common::UserId,
    tracing::{debug, info},
};

/// Stand-in engine that logs each command and echoes it back.
pub struct EchoEngine {
    user_id: UserId,
    receiver: Mutex<Option<Arc<dyn AssistantReceiver>>>,
}

impl EchoEngine {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            receiver: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AssistantEngine for EchoEngine {
    async fn handle_command(&self, text: &str) -> Result<()> {
        info!(user_id = %self.user_id, command = text, "command received");
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match receiver {
            Some(receiver) => receiver.send(&format!("echo: {text}")).await,
            None => {
                debug!(user_id = %self.user_id, "no receiver, reply dropped");
                Ok(())
            },
        }
    }

    async fn set_receiver(&self, receiver: Option<Arc<dyn AssistantReceiver>>) -> Result<()> {
        *self.receiver.lock().unwrap_or_else(|e| e.into_inner()) = receiver;
        Ok(())
    }
}
