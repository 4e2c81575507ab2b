use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, atomic::AtomicBool},
};

use {
    feedlink_common::{FeedId, UserId},
    feedlink_config::FeedlinkConfig,
    feedlink_feeds::FeedRegistry,
    feedlink_messaging::{
        ApiKey, ClientFactory, ClientOptions, CredentialStore, MessagingClient, has_credentials,
    },
    secrecy::ExposeSecret,
    tracing::{debug, error, info, warn},
    url::Url,
};

use crate::{
    binding::EngineBinding,
    engine::AssistantEngine,
    error::{Error, Result},
};

/// Lifecycle of the shared messaging client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No credentials have been provisioned.
    NoCredentials,
    /// A client exists but has never been started.
    Initialized,
    Running,
    Stopped,
}

/// Settings the manager builds clients and handshakes from.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub instance: String,
    pub sync: bool,
    pub api_key: ApiKey,
    /// Where the authorization page sends the user back to.
    pub return_url: Url,
    pub scopes: Vec<String>,
}

impl ManagerOptions {
    pub fn from_config(config: &FeedlinkConfig) -> Result<Self> {
        let secret = config
            .messaging
            .api_key_secret
            .as_ref()
            .map(|s| s.expose_secret().clone())
            .unwrap_or_default();
        Ok(Self {
            instance: config.messaging.instance.clone(),
            sync: config.messaging.sync,
            api_key: ApiKey::new(config.messaging.api_key_id.clone(), secret),
            return_url: config.link.return_url()?,
            scopes: config.link.scopes.clone(),
        })
    }
}

struct UserRecord {
    engine: Arc<dyn AssistantEngine>,
    feed_id: FeedId,
    binding: Option<Arc<EngineBinding>>,
}

struct State {
    link_state: LinkState,
    client: Option<Arc<dyn MessagingClient>>,
    registry: Option<Arc<FeedRegistry>>,
    users: HashMap<UserId, UserRecord>,
}

/// Owns the shared messaging client and one binding per registered user.
///
/// Constructed once by the process and handed to whatever needs it. No lock
/// is held across an await; start, stop and linking are expected to be
/// driven by one caller at a time.
pub struct AssistantManager {
    factory: Arc<dyn ClientFactory>,
    storage: Arc<dyn CredentialStore>,
    options: ManagerOptions,
    state: Mutex<State>,
    pub(crate) linking: AtomicBool,
}

impl AssistantManager {
    /// Build the manager, initializing a client when `storage` already holds
    /// credentials.
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        storage: Arc<dyn CredentialStore>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let manager = Self {
            factory,
            storage,
            options,
            state: Mutex::new(State {
                link_state: LinkState::NoCredentials,
                client: None,
                registry: None,
                users: HashMap::new(),
            }),
            linking: AtomicBool::new(false),
        };

        if has_credentials(manager.storage.as_ref()) {
            let client = manager.create_client()?;
            let mut state = manager.lock();
            state.client = Some(client);
            state.link_state = LinkState::Initialized;
            info!(instance = %manager.options.instance, "stored credentials found");
        } else {
            debug!("no stored credentials, linking required");
        }
        Ok(manager)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn storage(&self) -> &Arc<dyn CredentialStore> {
        &self.storage
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ClientFactory> {
        &self.factory
    }

    pub(crate) fn client_options(&self) -> ClientOptions {
        ClientOptions {
            instance: self.options.instance.clone(),
            storage: Arc::clone(&self.storage),
            sync: self.options.sync,
            api_key: self.options.api_key.clone(),
        }
    }

    fn create_client(&self) -> Result<Arc<dyn MessagingClient>> {
        Ok(self.factory.create(self.client_options())?)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Replace the shared client with a fresh one over the stored credentials.
    ///
    /// A running manager is stopped first.
    pub async fn init(&self) -> Result<()> {
        if self.state() == LinkState::Running {
            self.stop().await;
        }
        let client = self.create_client()?;
        let mut state = self.lock();
        state.client = Some(client);
        state.registry = None;
        state.link_state = LinkState::Initialized;
        info!(instance = %self.options.instance, "assistant manager initialized");
        Ok(())
    }

    /// Enable the client, start the feed registry and bind every registered
    /// user that has no binding yet.
    ///
    /// A user whose binding fails to start is logged and skipped; it is
    /// retried on the next `start()`.
    pub async fn start(&self) -> Result<()> {
        let client = {
            let state = self.lock();
            match state.link_state {
                LinkState::NoCredentials => return Err(Error::NotInitialized),
                LinkState::Running => {
                    debug!("assistant manager already running");
                    return Ok(());
                },
                LinkState::Initialized | LinkState::Stopped => state.client.clone(),
            }
        };
        let client = client.ok_or(Error::NotInitialized)?;

        client.enable();
        info!("messaging client enabled");

        let registry = FeedRegistry::new(Arc::clone(&client));
        if let Err(e) = registry.start().await {
            client.disable();
            error!(error = %e, "feed registry failed to start");
            return Err(e.into());
        }

        let pending: Vec<(UserId, Arc<dyn AssistantEngine>, FeedId)> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.registry = Some(Arc::clone(&registry));
            state.link_state = LinkState::Running;
            state
                .users
                .iter()
                .filter(|(_, record)| record.binding.is_none())
                .map(|(user_id, record)| {
                    (
                        user_id.clone(),
                        Arc::clone(&record.engine),
                        record.feed_id.clone(),
                    )
                })
                .collect()
        };

        info!(users = pending.len(), "assistant manager started");
        for (user_id, engine, feed_id) in pending {
            if let Err(e) = self
                .start_binding(&registry, user_id.clone(), engine, feed_id.clone())
                .await
            {
                error!(user_id = %user_id, feed_id = %feed_id, error = %e, "binding failed to start");
            }
        }
        Ok(())
    }

    /// Stop every binding and disable the client.
    ///
    /// Best effort: failures are logged and the client is disabled regardless.
    /// User registrations are kept for the next `start()`.
    pub async fn stop(&self) {
        let (client, registry, bindings) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.link_state != LinkState::Running {
                debug!(state = ?state.link_state, "assistant manager not running");
                return;
            }
            state.link_state = LinkState::Stopped;
            let bindings: Vec<Arc<EngineBinding>> = state
                .users
                .values_mut()
                .filter_map(|record| record.binding.take())
                .collect();
            (state.client.clone(), state.registry.take(), bindings)
        };

        for binding in bindings {
            if let Err(e) = binding.stop().await {
                warn!(user_id = %binding.user_id(), error = %e, "failed to stop binding");
            }
        }
        if let Some(registry) = registry {
            registry.stop();
        }
        if let Some(client) = client {
            client.disable();
            info!("messaging client disabled");
        }
        info!("assistant manager stopped");
    }

    /// Stop, drop the client and clear stored credentials.
    pub async fn unlink(&self) -> Result<()> {
        self.stop().await;
        {
            let mut state = self.lock();
            state.client = None;
            state.registry = None;
            state.link_state = LinkState::NoCredentials;
        }
        self.storage.clear()?;
        info!("messaging account unlinked");
        Ok(())
    }

    // ── Registrations ───────────────────────────────────────────────────────

    /// Register `user_id`'s engine for `feed_id`.
    ///
    /// While running the binding starts immediately and its start error, if
    /// any, is returned; the registration is kept either way. Otherwise the
    /// binding waits for the next `start()`. An existing registration for the
    /// user is replaced and its binding stopped.
    ///
    /// A feed serves one user: binding a feed already registered for someone
    /// else fails with [`Error::FeedInUse`].
    pub async fn add_engine(
        &self,
        user_id: UserId,
        engine: Arc<dyn AssistantEngine>,
        feed_id: FeedId,
    ) -> Result<()> {
        let (previous, registry) = {
            let mut state = self.lock();
            if let Some((owner, _)) = state
                .users
                .iter()
                .find(|(owner, record)| **owner != user_id && record.feed_id == feed_id)
            {
                return Err(Error::FeedInUse {
                    feed_id: feed_id.to_string(),
                    user_id: owner.to_string(),
                });
            }
            let previous = state
                .users
                .insert(user_id.clone(), UserRecord {
                    engine: Arc::clone(&engine),
                    feed_id: feed_id.clone(),
                    binding: None,
                })
                .and_then(|record| record.binding);
            let registry = match state.link_state {
                LinkState::Running => state.registry.clone(),
                _ => None,
            };
            (previous, registry)
        };

        if let Some(previous) = previous {
            debug!(user_id = %user_id, "replacing existing binding");
            if let Err(e) = previous.stop().await {
                warn!(user_id = %user_id, error = %e, "failed to stop replaced binding");
            }
        }

        match registry {
            Some(registry) => {
                let result = self
                    .start_binding(&registry, user_id.clone(), engine, feed_id.clone())
                    .await;
                if let Err(e) = &result {
                    error!(user_id = %user_id, feed_id = %feed_id, error = %e, "binding failed to start");
                }
                result
            },
            None => {
                debug!(user_id = %user_id, feed_id = %feed_id, "binding deferred until start");
                Ok(())
            },
        }
    }

    /// Stop `user_id`'s binding and forget the registration. Returns whether
    /// the user was registered.
    pub async fn remove_engine(&self, user_id: &UserId) -> bool {
        let record = self.lock().users.remove(user_id);
        let Some(record) = record else {
            debug!(user_id = %user_id, "remove for unregistered user");
            return false;
        };
        if let Some(binding) = record.binding
            && let Err(e) = binding.stop().await
        {
            warn!(user_id = %user_id, error = %e, "failed to stop binding");
        }
        info!(user_id = %user_id, "engine removed");
        true
    }

    /// Add `contact_id` as a contact, find or create the feed shared with it
    /// and register `user_id`'s engine on that feed.
    ///
    /// A contact added before a later step fails stays added.
    pub async fn create_feed_for_engine(
        &self,
        user_id: UserId,
        engine: Arc<dyn AssistantEngine>,
        contact_id: &str,
    ) -> Result<FeedId> {
        let registry = self.registry().ok_or(Error::NotRunning)?;
        registry.add_account_to_contacts(contact_id).await?;
        let feed = registry.get_feed_with_contact(contact_id).await?;
        let feed_id = feed.id().clone();
        self.add_engine(user_id, engine, feed_id.clone()).await?;
        Ok(feed_id)
    }

    async fn start_binding(
        &self,
        registry: &Arc<FeedRegistry>,
        user_id: UserId,
        engine: Arc<dyn AssistantEngine>,
        feed_id: FeedId,
    ) -> Result<()> {
        let binding = EngineBinding::new(
            user_id.clone(),
            registry.get_feed(&feed_id),
            Arc::clone(&engine),
        );
        binding.start().await?;

        let attached = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let current = state.link_state == LinkState::Running
                && state
                    .registry
                    .as_ref()
                    .is_some_and(|r| Arc::ptr_eq(r, registry));
            match state.users.get_mut(&user_id) {
                Some(record)
                    if current
                        && record.binding.is_none()
                        && Arc::ptr_eq(&record.engine, &engine) =>
                {
                    record.binding = Some(Arc::clone(&binding));
                    true
                },
                _ => false,
            }
        };

        if !attached {
            debug!(user_id = %user_id, "registration changed while binding started");
            if let Err(e) = binding.stop().await {
                warn!(user_id = %user_id, error = %e, "failed to stop stale binding");
            }
        }
        Ok(())
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    pub fn state(&self) -> LinkState {
        self.lock().link_state
    }

    pub fn client(&self) -> Option<Arc<dyn MessagingClient>> {
        self.lock().client.clone()
    }

    /// The feed registry of the running client.
    pub fn registry(&self) -> Option<Arc<FeedRegistry>> {
        self.lock().registry.clone()
    }

    pub fn registered_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.lock().users.keys().cloned().collect();
        users.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        users
    }

    pub fn has_active_binding(&self, user_id: &UserId) -> bool {
        self.binding(user_id).is_some()
    }

    pub fn binding(&self, user_id: &UserId) -> Option<Arc<EngineBinding>> {
        self.lock()
            .users
            .get(user_id)
            .and_then(|record| record.binding.clone())
    }

    pub fn feed_for_user(&self, user_id: &UserId) -> Option<FeedId> {
        self.lock()
            .users
            .get(user_id)
            .map(|record| record.feed_id.clone())
    }
}
