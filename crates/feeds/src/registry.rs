use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use {
    feedlink_common::{FeedId, ObjectId},
    feedlink_messaging::{ChangeKind, FeedDescriptor, MessagingClient, StoredObject, Subscription},
    serde_json::json,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use feedlink_metrics::{feeds as feed_metrics, gauge};

use crate::{
    error::{Error, Result},
    feed::Feed,
};

/// Live [`Feed`]s of one messaging client, keyed by feed identifier.
///
/// At most one `Feed` exists per identifier. Entries are created lazily by
/// [`get_feed`](Self::get_feed) and dropped when the feed closes or the feed
/// is deleted from the `feeds` collection.
pub struct FeedRegistry {
    client: Arc<dyn MessagingClient>,
    feeds: Mutex<HashMap<FeedId, Arc<Feed>>>,
    own_id: OnceLock<ObjectId>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FeedRegistry {
    pub fn new(client: Arc<dyn MessagingClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            feeds: Mutex::new(HashMap::new()),
            own_id: OnceLock::new(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Watch the `feeds` collection and resolve the local account.
    ///
    /// Fails with [`Error::NoOwnAccount`] when no account is flagged `owned`;
    /// the watchers are released again in that case.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
        {
            return Err(Error::invalid_state("feed registry already started"));
        }

        let feeds = self.client.store().feeds().await?;

        let weak = Arc::downgrade(self);
        let on_delete = feeds.subscribe(
            ChangeKind::Delete,
            Arc::new(move |obj: &StoredObject| {
                if let Some(registry) = weak.upgrade() {
                    registry.on_feed_deleted(obj);
                }
            }),
        );
        let weak = Arc::downgrade(self);
        let on_update = feeds.subscribe(
            ChangeKind::Update,
            Arc::new(move |obj: &StoredObject| {
                if let Some(registry) = weak.upgrade() {
                    registry.on_feed_updated(obj);
                }
            }),
        );

        let own_id = self.resolve_own_id().await?;
        if self.own_id.set(own_id.clone()).is_err() {
            debug!("own identity already resolved for this registry");
        }

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([on_delete, on_update]);
        info!(own_id = %own_id, "feed registry started");
        Ok(())
    }

    /// Stop watching the `feeds` collection. Open feeds stay open.
    pub fn stop(&self) {
        let subscriptions =
            std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()));
        if subscriptions.is_empty() {
            return;
        }
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        info!("feed registry stopped");
    }

    /// The registry's `Feed` for `feed_id`, created unopened when absent.
    pub fn get_feed(self: &Arc<Self>, feed_id: &FeedId) -> Arc<Feed> {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        let feed = Arc::clone(feeds.entry(feed_id.clone()).or_insert_with(|| {
            debug!(feed_id = %feed_id, "registering feed");
            Arc::new(Feed::new(
                feed_id.clone(),
                Arc::clone(&self.client),
                Arc::downgrade(self),
            ))
        }));
        #[cfg(feature = "metrics")]
        gauge!(feed_metrics::REGISTERED).set(feeds.len() as f64);
        feed
    }

    /// Drop the entry for `feed_id`, if any.
    pub fn feed_closed(&self, feed_id: &FeedId) {
        let mut feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
        if feeds.remove(feed_id).is_some() {
            debug!(feed_id = %feed_id, "feed released");
        }
        #[cfg(feature = "metrics")]
        gauge!(feed_metrics::REGISTERED).set(feeds.len() as f64);
    }

    /// Drop `feed`'s entry unless it has already been replaced.
    pub(crate) fn release(&self, feed: &Feed) {
        let current = {
            let feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
            feeds.get(feed.id()).map(|f| std::ptr::eq(Arc::as_ptr(f), feed))
        };
        if current == Some(true) {
            self.feed_closed(feed.id());
        }
    }

    pub fn contains(&self, feed_id: &FeedId) -> bool {
        self.feeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(feed_id)
    }

    pub fn len(&self) -> usize {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The local account's object id. Set by [`start`](Self::start).
    pub fn own_id(&self) -> Result<ObjectId> {
        self.own_id
            .get()
            .cloned()
            .ok_or_else(|| Error::invalid_state("feed registry has not been started"))
    }

    pub async fn add_account_to_contacts(&self, contact_id: &str) -> Result<()> {
        self.client
            .identity()
            .add_account_to_contacts(contact_id)
            .await?;
        debug!(contact_id, "contact added");
        Ok(())
    }

    /// The one-to-one feed with `contact_id`, created when missing. Not opened.
    pub async fn get_feed_with_contact(self: &Arc<Self>, contact_id: &str) -> Result<Arc<Feed>> {
        let (descriptor, existed) = self
            .client
            .feeds()
            .get_or_create_feed_with_members(&[contact_id.to_string()])
            .await?;
        if existed {
            info!(feed_id = %descriptor.identifier, contact_id, "reusing feed with contact");
        } else {
            info!(feed_id = %descriptor.identifier, contact_id, "created feed with contact");
        }
        Ok(self.get_feed(&descriptor.identifier))
    }

    async fn resolve_own_id(&self) -> Result<ObjectId> {
        let accounts = self.client.store().accounts().await?;
        let owned = accounts.find(&json!({ "owned": true })).await?;
        if owned.len() > 1 {
            warn!(count = owned.len(), "several owned accounts, using the first");
        }
        owned
            .into_iter()
            .next()
            .map(|obj| obj.id)
            .ok_or(Error::NoOwnAccount)
    }

    fn on_feed_deleted(&self, obj: &StoredObject) {
        let feed_id = FeedId::new(obj.key.as_str());
        debug!(feed_id = %feed_id, "feed deleted upstream");
        self.feed_closed(&feed_id);
    }

    fn on_feed_updated(&self, obj: &StoredObject) {
        let feed = {
            let feeds = self.feeds.lock().unwrap_or_else(|e| e.into_inner());
            feeds.get(obj.key.as_str()).cloned()
        };
        let Some(feed) = feed.filter(|f| f.is_open()) else {
            return;
        };
        match FeedDescriptor::from_object(obj) {
            Ok(descriptor) => feed.update(descriptor),
            Err(e) => warn!(feed_id = %feed.id(), error = %e, "ignoring undecodable feed update"),
        }
    }
}
