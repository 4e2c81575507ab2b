use std::{fmt, sync::Arc};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    tracing::debug,
    url::Url,
};

use crate::{
    Result,
    credentials::CredentialStore,
    records::FeedDescriptor,
    store::ObjectStore,
};

/// Lifecycle state of a client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Constructed, never enabled.
    Idle,
    Enabled,
    Disabled,
}

/// Application key presented to the messaging service.
#[derive(Clone)]
pub struct ApiKey {
    pub id: String,
    pub secret: Secret<String>,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: Secret::new(secret.into()),
        }
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field(
                "secret",
                &if self.secret.expose_secret().is_empty() {
                    "[EMPTY]"
                } else {
                    "[REDACTED]"
                },
            )
            .finish()
    }
}

/// Everything needed to construct a client.
#[derive(Clone)]
pub struct ClientOptions {
    /// Installation name.
    pub instance: String,
    pub storage: Arc<dyn CredentialStore>,
    /// Replicate the store continuously once enabled.
    pub sync: bool,
    pub api_key: ApiKey,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("instance", &self.instance)
            .field("sync", &self.sync)
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

/// Result of requesting an authorization page.
#[derive(Debug, Clone)]
pub struct AuthPage {
    /// Where the user must be sent to approve the link. Its query carries
    /// the handshake key.
    pub link: Url,
}

/// Text delivery.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Deliver `text` to `feed` immediately, without queueing.
    async fn send_text_to_feed(&self, feed: &FeedDescriptor, text: &str) -> Result<()>;
}

/// Contact management.
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn add_account_to_contacts(&self, contact_id: &str) -> Result<()>;
}

/// Feed membership lookups.
#[async_trait]
pub trait FeedApi: Send + Sync {
    /// Find the feed whose members are exactly `members`, creating it when
    /// none exists. The flag is `true` when an existing feed was reused.
    async fn get_or_create_feed_with_members(
        &self,
        members: &[String],
    ) -> Result<(FeedDescriptor, bool)>;
}

/// The linking handshake.
#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn get_auth_page(&self, return_url: &Url, scopes: &[String]) -> Result<AuthPage>;

    /// Submit the authorization code together with the handshake key.
    async fn confirm_auth(&self, code: &str, key: &str) -> Result<()>;

    /// Resolves once the service reports the account as signed up.
    async fn signed_up(&self) -> Result<()>;
}

/// Handle to the messaging service.
pub trait MessagingClient: Send + Sync {
    fn enable(&self);
    fn disable(&self);
    fn state(&self) -> ClientState;

    fn store(&self) -> &dyn ObjectStore;
    fn messaging(&self) -> &dyn MessagingApi;
    fn identity(&self) -> &dyn IdentityApi;
    fn feeds(&self) -> &dyn FeedApi;
    fn auth(&self) -> &dyn AuthApi;

    fn is_enabled(&self) -> bool {
        self.state() == ClientState::Enabled
    }
}

/// Builds client handles.
pub trait ClientFactory: Send + Sync {
    fn create(&self, options: ClientOptions) -> Result<Arc<dyn MessagingClient>>;
}

/// Keeps a client enabled for the guard's lifetime.
///
/// The client is disabled when the guard drops, on success and error paths
/// alike.
pub struct ScopedEnable {
    client: Arc<dyn MessagingClient>,
}

impl ScopedEnable {
    pub fn new(client: Arc<dyn MessagingClient>) -> Self {
        client.enable();
        debug!("scoped client enabled");
        Self { client }
    }

    pub fn client(&self) -> &dyn MessagingClient {
        self.client.as_ref()
    }
}

impl Drop for ScopedEnable {
    fn drop(&mut self) {
        self.client.disable();
        debug!("scoped client disabled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_debug_hides_secret() {
        let key = ApiKey::new("app-1", "very-secret");
        let out = format!("{key:?}");
        assert!(out.contains("app-1"));
        assert!(out.contains("[REDACTED]"));
        assert!(!out.contains("very-secret"));
    }
}
