//! Two-phase linking handshake that provisions the messaging credentials.
//!
//! Phase one ([`AssistantManager::begin_link`]) asks the auth service for an
//! authorization page and stashes the handshake key in the caller's session.
//! Phase two ([`AssistantManager::complete_link`]) confirms the authorization
//! code returned to the callback together with that key, waits for the
//! account to be signed up, then initializes and starts the manager.
//!
//! Each phase uses its own short-lived client over the manager's credential
//! storage, enabled only for the duration of its exchange.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use {
    feedlink_messaging::ScopedEnable,
    tracing::{info, warn},
    url::Url,
};

#[cfg(feature = "metrics")]
use feedlink_metrics::{counter, link as link_metrics};

use crate::{
    error::{Error, Result},
    manager::AssistantManager,
};

/// Session entry holding the handshake key between the two phases.
pub const HANDSHAKE_SESSION_KEY: &str = "handshakeKey";
/// Query parameter of the authorization link that carries the handshake key.
pub const LINK_KEY_PARAM: &str = "k";
/// Callback query parameter carrying the authorization code.
pub const CODE_PARAM: &str = "code";

/// Per-visitor state that survives between the two phases.
pub trait LinkSession: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn insert(&mut self, key: &str, value: String);
    fn remove(&mut self, key: &str) -> Option<String>;
}

impl LinkSession for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }

    fn insert(&mut self, key: &str, value: String) {
        HashMap::insert(self, key.to_string(), value);
    }

    fn remove(&mut self, key: &str) -> Option<String> {
        HashMap::remove(self, key)
    }
}

/// Marks a handshake as in flight until dropped.
struct LinkGuard<'a>(&'a AtomicBool);

impl<'a> LinkGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::LinkInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for LinkGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn logged<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        warn!(error = %e, "linking handshake failed");
        #[cfg(feature = "metrics")]
        counter!(link_metrics::FAILURES_TOTAL).increment(1);
    }
    result
}

impl AssistantManager {
    /// Phase one: obtain the authorization link the user must visit.
    ///
    /// The handshake key found in the link is written to `session` under
    /// [`HANDSHAKE_SESSION_KEY`].
    pub async fn begin_link(&self, session: &mut dyn LinkSession) -> Result<Url> {
        let _guard = LinkGuard::acquire(&self.linking)?;
        #[cfg(feature = "metrics")]
        counter!(link_metrics::STARTS_TOTAL).increment(1);

        logged(self.request_link(session).await)
    }

    async fn request_link(&self, session: &mut dyn LinkSession) -> Result<Url> {
        let client = self.factory().create(self.client_options())?;
        let page = {
            let scoped = ScopedEnable::new(client);
            scoped
                .client()
                .auth()
                .get_auth_page(&self.options().return_url, &self.options().scopes)
                .await
                .map_err(Error::handshake_failed)?
        };

        let key = page
            .link
            .query_pairs()
            .find(|(name, _)| *name == LINK_KEY_PARAM)
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| {
                Error::handshake_failed(format!(
                    "authorization link carries no `{LINK_KEY_PARAM}` parameter"
                ))
            })?;
        session.insert(HANDSHAKE_SESSION_KEY, key);
        info!(host = ?page.link.host_str(), "authorization link issued");
        Ok(page.link)
    }

    /// Phase two: confirm the authorization `code` from the callback `query`
    /// with the key stashed in `session`, then initialize and start.
    ///
    /// A rejected code or key leaves the manager's state untouched.
    pub async fn complete_link(
        &self,
        query: &HashMap<String, String>,
        session: &mut dyn LinkSession,
    ) -> Result<()> {
        let _guard = LinkGuard::acquire(&self.linking)?;
        logged(self.confirm_link(query, session).await)?;

        self.init().await?;
        self.start().await?;
        info!("messaging account linked");
        #[cfg(feature = "metrics")]
        counter!(link_metrics::COMPLETIONS_TOTAL).increment(1);
        Ok(())
    }

    async fn confirm_link(
        &self,
        query: &HashMap<String, String>,
        session: &mut dyn LinkSession,
    ) -> Result<()> {
        let code = query
            .get(CODE_PARAM)
            .filter(|code| !code.is_empty())
            .ok_or_else(|| Error::handshake_failed("callback carries no authorization code"))?;
        let key = session
            .remove(HANDSHAKE_SESSION_KEY)
            .ok_or_else(|| Error::handshake_failed("no handshake in progress for this session"))?;

        let client = self.factory().create(self.client_options())?;
        let scoped = ScopedEnable::new(client);
        let auth = scoped.client().auth();
        auth.confirm_auth(code, &key)
            .await
            .map_err(Error::handshake_failed)?;
        auth.signed_up().await.map_err(Error::handshake_failed)?;
        Ok(())
    }
}
