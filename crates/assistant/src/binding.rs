use std::sync::{Arc, Mutex};

use {
    async_trait::async_trait,
    feedlink_common::UserId,
    feedlink_feeds::{Feed, FeedEventKind, FeedState},
    feedlink_messaging::{FeedMessage, Subscription},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

#[cfg(feature = "metrics")]
use feedlink_metrics::{assistant as assistant_metrics, counter, gauge};

use crate::{
    engine::{AssistantEngine, AssistantReceiver},
    error::{Error, Result},
};

#[derive(Default)]
struct Running {
    /// Set once this binding's own `open()` succeeded.
    active: bool,
    inbound: Option<Subscription>,
    cancel: Option<CancellationToken>,
}

/// Live link between one feed and one user's engine.
///
/// Incoming text is queued for a worker task that hands it to
/// [`AssistantEngine::handle_command`] in arrival order; handler errors are
/// logged and dropped. The binding registers itself as the engine's
/// [`AssistantReceiver`] so replies go back to the same feed.
pub struct EngineBinding {
    user_id: UserId,
    feed: Arc<Feed>,
    engine: Arc<dyn AssistantEngine>,
    running: Mutex<Running>,
}

impl EngineBinding {
    pub fn new(user_id: UserId, feed: Arc<Feed>, engine: Arc<dyn AssistantEngine>) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            feed,
            engine,
            running: Mutex::new(Running::default()),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn feed(&self) -> &Arc<Feed> {
        &self.feed
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
    }

    /// Listen for incoming text, register as the engine's receiver, then
    /// open the feed.
    ///
    /// All or nothing: if any step fails everything done so far is undone
    /// and the error is returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let cancel = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            if running.cancel.is_some() {
                return Err(Error::AlreadyStarted {
                    user_id: self.user_id.to_string(),
                });
            }
            let cancel = CancellationToken::new();
            running.cancel = Some(cancel.clone());
            cancel
        };

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let user_id = self.user_id.clone();
        let inbound = self.feed.on(
            FeedEventKind::Incoming,
            Arc::new(move |message: &FeedMessage| {
                if message.hidden || !message.is_text() {
                    trace!(user_id = %user_id, kind = %message.kind, "ignoring non-command message");
                    return;
                }
                let Some(text) = message.text.clone() else {
                    return;
                };
                if tx.send(text).is_err() {
                    debug!(user_id = %user_id, "command worker gone, dropping message");
                }
            }),
        );
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .inbound = Some(inbound);

        tokio::spawn(dispatch(
            self.user_id.clone(),
            Arc::clone(&self.engine),
            rx,
            cancel,
        ));

        let receiver: Arc<dyn AssistantReceiver> = Arc::clone(self) as Arc<dyn AssistantReceiver>;
        if let Err(e) = self.engine.set_receiver(Some(receiver)).await {
            self.unwind().await;
            return Err(Error::engine("registering reply receiver", e));
        }

        if let Err(e) = self.feed.open().await {
            self.unwind().await;
            return Err(e.into());
        }

        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active = true;
        info!(user_id = %self.user_id, feed_id = %self.feed.id(), "binding started");
        #[cfg(feature = "metrics")]
        gauge!(assistant_metrics::BINDINGS_ACTIVE).increment(1.0);
        Ok(())
    }

    /// Stop listening, clear the engine's receiver and close the feed.
    ///
    /// The feed is only closed when this binding opened it. Safe on a binding
    /// that never started. Every step is attempted; the first failure is
    /// returned.
    pub async fn stop(&self) -> Result<()> {
        let was_active = self.release();
        let receiver = self.engine.set_receiver(None).await;
        let close = if was_active {
            self.feed.close().await
        } else {
            Ok(())
        };

        if was_active {
            info!(user_id = %self.user_id, feed_id = %self.feed.id(), "binding stopped");
            #[cfg(feature = "metrics")]
            gauge!(assistant_metrics::BINDINGS_ACTIVE).decrement(1.0);
        }

        receiver.map_err(|e| Error::engine("clearing reply receiver", e))?;
        close?;
        Ok(())
    }

    /// Reply on the bound feed.
    pub async fn send(&self, text: &str) -> Result<()> {
        self.feed.send_text(text).await?;
        Ok(())
    }

    fn release(&self) -> bool {
        let running = std::mem::take(&mut *self.running.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(inbound) = running.inbound {
            inbound.unsubscribe();
        }
        if let Some(cancel) = running.cancel {
            cancel.cancel();
        }
        running.active
    }

    async fn unwind(&self) {
        self.release();
        if let Err(e) = self.engine.set_receiver(None).await {
            warn!(user_id = %self.user_id, error = %e, "failed to clear reply receiver");
        }
        // This binding never opened the feed. Release its registry entry only
        // when no one else has it open or opening.
        if self.feed.state() == FeedState::Closed
            && let Err(e) = self.feed.close().await
        {
            warn!(user_id = %self.user_id, error = %e, "failed to release feed");
        }
        #[cfg(feature = "metrics")]
        counter!(assistant_metrics::BINDING_START_FAILURES_TOTAL).increment(1);
    }
}

#[async_trait]
impl AssistantReceiver for EngineBinding {
    async fn send(&self, text: &str) -> anyhow::Result<()> {
        EngineBinding::send(self, text).await?;
        Ok(())
    }
}

async fn dispatch(
    user_id: UserId,
    engine: Arc<dyn AssistantEngine>,
    mut commands: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = commands.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };

        debug!(user_id = %user_id, len = text.len(), "dispatching command");
        #[cfg(feature = "metrics")]
        counter!(assistant_metrics::COMMANDS_TOTAL).increment(1);

        if let Err(e) = engine.handle_command(&text).await {
            warn!(user_id = %user_id, error = %e, "command handler failed");
            #[cfg(feature = "metrics")]
            counter!(assistant_metrics::COMMAND_FAILURES_TOTAL).increment(1);
        }
    }
    trace!(user_id = %user_id, "command worker stopped");
}
