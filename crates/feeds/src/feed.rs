use std::sync::{Arc, Mutex, Weak};

use {
    feedlink_common::{FeedId, ObjectId},
    feedlink_messaging::{
        ChangeKind, FeedDescriptor, FeedMessage, MessagingClient, StoredObject, Subscription,
    },
    tracing::{debug, info, trace, warn},
};

#[cfg(feature = "metrics")]
use feedlink_metrics::{counter, feeds as feed_metrics};

use crate::{
    error::{Error, Result},
    registry::FeedRegistry,
};

/// Open/closed state of a [`Feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Closed,
    /// `open()` is in flight.
    Opening,
    Open,
}

/// Message events a feed emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedEventKind {
    /// Every inserted message, hidden ones included.
    NewMessage,
    /// Sent by anyone other than the local account.
    Incoming,
    /// Sent by the local account.
    Outgoing,
}

pub type MessageListener = Arc<dyn Fn(&FeedMessage) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, FeedEventKind, MessageListener)>,
}

struct Inner {
    state: FeedState,
    descriptor: Option<FeedDescriptor>,
    /// Bumped by every `close()` so an in-flight `open()` can tell it lost.
    generation: u64,
    insert_sub: Option<Subscription>,
}

/// One conversation.
///
/// Created unopened by [`FeedRegistry::get_feed`]. While open, every insert
/// into the feed's message collection is decoded and emitted as
/// [`FeedEventKind::NewMessage`] plus either `Incoming` or `Outgoing`.
/// Hidden messages are emitted like any other; filtering them is up to the
/// listener.
pub struct Feed {
    feed_id: FeedId,
    client: Arc<dyn MessagingClient>,
    registry: Weak<FeedRegistry>,
    inner: Mutex<Inner>,
    listeners: Arc<Mutex<Listeners>>,
}

impl Feed {
    pub(crate) fn new(
        feed_id: FeedId,
        client: Arc<dyn MessagingClient>,
        registry: Weak<FeedRegistry>,
    ) -> Self {
        Self {
            feed_id,
            client,
            registry,
            inner: Mutex::new(Inner {
                state: FeedState::Closed,
                descriptor: None,
                generation: 0,
                insert_sub: None,
            }),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    pub fn id(&self) -> &FeedId {
        &self.feed_id
    }

    pub fn state(&self) -> FeedState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == FeedState::Open
    }

    /// The cached descriptor, present once the feed has been opened.
    pub fn descriptor(&self) -> Option<FeedDescriptor> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .descriptor
            .clone()
    }

    /// Register `listener` for events of `kind`.
    pub fn on(&self, kind: FeedEventKind, listener: MessageListener) -> Subscription {
        let id = {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.entries.push((id, kind, listener));
            id
        };

        let weak = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
                listeners.entries.retain(|(entry, ..)| *entry != id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// Look up the descriptor and start listening for inserted messages.
    ///
    /// Fails with [`Error::AlreadyOpen`] unless the feed is closed. If
    /// `close()` runs while this is in flight, the listener is released and
    /// [`Error::InvalidState`] is returned.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let generation = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.state != FeedState::Closed {
                return Err(Error::already_open(&self.feed_id));
            }
            inner.state = FeedState::Opening;
            inner.generation
        };

        let result = self.attach(generation).await;
        if result.is_err() {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.generation == generation && inner.state == FeedState::Opening {
                inner.state = FeedState::Closed;
            }
        }
        result
    }

    async fn attach(self: &Arc<Self>, generation: u64) -> Result<()> {
        let own_id = self.own_id()?;
        let descriptor = self.lookup().await?;
        let objects = self
            .client
            .store()
            .feed_objects(&descriptor.object_id)
            .await?;

        let weak = Arc::downgrade(self);
        let subscription = objects.subscribe(
            ChangeKind::Insert,
            Arc::new(move |obj: &StoredObject| {
                if let Some(feed) = weak.upgrade() {
                    feed.on_insert(obj, &own_id);
                }
            }),
        );

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.generation != generation || inner.state != FeedState::Opening {
            drop(inner);
            subscription.unsubscribe();
            return Err(Error::invalid_state(format!(
                "feed {} was closed while opening",
                self.feed_id
            )));
        }
        inner.descriptor = Some(descriptor);
        inner.insert_sub = Some(subscription);
        inner.state = FeedState::Open;
        drop(inner);

        info!(feed_id = %self.feed_id, "feed opened");
        #[cfg(feature = "metrics")]
        counter!(feed_metrics::OPENED_TOTAL).increment(1);
        Ok(())
    }

    /// Stop listening and release the registry entry.
    ///
    /// Safe on a feed that never finished opening. Once this returns no
    /// further events are emitted.
    pub async fn close(&self) -> Result<()> {
        let subscription = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.generation += 1;
            inner.state = FeedState::Closed;
            inner.insert_sub.take()
        };

        if let Some(subscription) = subscription {
            subscription.unsubscribe();
            info!(feed_id = %self.feed_id, "feed closed");
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.release(self);
        }
        Ok(())
    }

    /// Replace the cached descriptor.
    pub fn update(&self, descriptor: FeedDescriptor) {
        debug!(feed_id = %self.feed_id, "feed descriptor updated");
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.descriptor = Some(descriptor);
    }

    /// Deliver `text` to the feed now. Retrying is up to the caller.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let descriptor = match self.descriptor() {
            Some(descriptor) => descriptor,
            None => self.lookup().await?,
        };

        match self
            .client
            .messaging()
            .send_text_to_feed(&descriptor, text)
            .await
        {
            Ok(()) => {
                trace!(feed_id = %self.feed_id, len = text.len(), "text sent");
                #[cfg(feature = "metrics")]
                counter!(feed_metrics::MESSAGES_SENT_TOTAL).increment(1);
                Ok(())
            },
            Err(e) => {
                #[cfg(feature = "metrics")]
                counter!(feed_metrics::SEND_FAILURES_TOTAL).increment(1);
                Err(Error::send_failed(&self.feed_id, e))
            },
        }
    }

    fn own_id(&self) -> Result<ObjectId> {
        self.registry
            .upgrade()
            .ok_or_else(|| Error::invalid_state("feed registry is gone"))?
            .own_id()
    }

    async fn lookup(&self) -> Result<FeedDescriptor> {
        let feeds = self.client.store().feeds().await?;
        let obj = feeds
            .get_by_key(self.feed_id.as_str())
            .await?
            .ok_or_else(|| Error::not_found("feed", &self.feed_id))?;
        Ok(FeedDescriptor::from_object(&obj)?)
    }

    fn on_insert(&self, obj: &StoredObject, own_id: &ObjectId) {
        if self.state() == FeedState::Closed {
            return;
        }

        let message = match FeedMessage::from_object(obj) {
            Ok(message) => message,
            Err(e) => {
                warn!(feed_id = %self.feed_id, error = %e, "skipping undecodable feed object");
                return;
            },
        };

        #[cfg(feature = "metrics")]
        counter!(feed_metrics::MESSAGES_RECEIVED_TOTAL).increment(1);

        let direction = if message.sender_id == own_id.as_str() {
            FeedEventKind::Outgoing
        } else {
            FeedEventKind::Incoming
        };
        trace!(feed_id = %self.feed_id, sender = %message.sender_id, ?direction, "feed message");

        self.emit(FeedEventKind::NewMessage, &message);
        self.emit(direction, &message);
    }

    fn emit(&self, kind: FeedEventKind, message: &FeedMessage) {
        let targets: Vec<MessageListener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .entries
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, l)| Arc::clone(l))
                .collect()
        };
        for listener in targets {
            listener(message);
        }
    }
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("feed_id", &self.feed_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        feedlink_messaging::{
            ApiKey, AuthApi, ChangeListener, ClientFactory, ClientOptions, ClientState,
            Collection, CollectionName, FeedApi, IdentityApi, MemoryCredentialStore,
            MessagingApi, ObjectStore,
            memory::{Faults, MemoryBackend},
        },
        serde_json::Value,
        tokio::sync::Notify,
    };

    struct Fixture {
        backend: MemoryBackend,
        registry: Arc<FeedRegistry>,
        me: ObjectId,
        descriptor: FeedDescriptor,
    }

    async fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let me = backend.own_account("me");
        let descriptor = backend.add_feed("F1", &["me", "other"]);
        let client = backend
            .create(ClientOptions {
                instance: "test".into(),
                storage: Arc::new(MemoryCredentialStore::new()),
                sync: true,
                api_key: ApiKey::new("id", "secret"),
            })
            .unwrap();
        client.enable();
        let registry = FeedRegistry::new(client);
        registry.start().await.unwrap();
        Fixture {
            backend,
            registry,
            me,
            descriptor,
        }
    }

    fn collect(feed: &Feed, kind: FeedEventKind) -> (Arc<Mutex<Vec<FeedMessage>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = feed.on(
            kind,
            Arc::new(move |m: &FeedMessage| sink.lock().unwrap().push(m.clone())),
        );
        (seen, sub)
    }

    #[tokio::test]
    async fn incoming_text_is_classified() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        assert_eq!(feed.state(), FeedState::Closed);
        feed.open().await.unwrap();

        let (incoming, _a) = collect(&feed, FeedEventKind::Incoming);
        let (outgoing, _b) = collect(&feed, FeedEventKind::Outgoing);
        let (all, _c) = collect(&feed, FeedEventKind::NewMessage);

        fx.backend
            .inject_message(&fx.descriptor, FeedMessage::text("other", "hi"));
        fx.backend
            .inject_message(&fx.descriptor, FeedMessage::text(fx.me.as_str(), "reply"));

        let incoming = incoming.lock().unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].text.as_deref(), Some("hi"));
        assert_eq!(outgoing.lock().unwrap()[0].text.as_deref(), Some("reply"));
        assert_eq!(all.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn open_twice_is_rejected() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.open().await.unwrap();
        assert!(matches!(
            feed.open().await,
            Err(Error::AlreadyOpen { .. })
        ));
    }

    #[tokio::test]
    async fn open_unknown_feed_is_not_found() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("missing"));
        assert!(matches!(feed.open().await, Err(Error::NotFound { .. })));
        assert_eq!(feed.state(), FeedState::Closed);
    }

    #[tokio::test]
    async fn no_events_after_close() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.open().await.unwrap();
        let (all, _sub) = collect(&feed, FeedEventKind::NewMessage);

        feed.close().await.unwrap();
        fx.backend
            .inject_message(&fx.descriptor, FeedMessage::text("other", "late"));

        assert!(all.lock().unwrap().is_empty());
        assert_eq!(
            fx.backend
                .listener_count(&CollectionName::FeedObjects(fx.descriptor.object_id.clone())),
            0
        );
        assert!(!fx.registry.contains(&FeedId::new("F1")));
    }

    #[tokio::test]
    async fn close_without_open_is_harmless() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.close().await.unwrap();
        feed.close().await.unwrap();
        assert_eq!(feed.state(), FeedState::Closed);
    }

    #[tokio::test]
    async fn hidden_messages_still_reach_new_message_listeners() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.open().await.unwrap();
        let (all, _sub) = collect(&feed, FeedEventKind::NewMessage);

        fx.backend
            .inject_message(&fx.descriptor, FeedMessage::text("other", "meta").hidden());

        let all = all.lock().unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].hidden);
    }

    #[tokio::test]
    async fn send_text_goes_out_as_outgoing() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.open().await.unwrap();
        let (outgoing, _sub) = collect(&feed, FeedEventKind::Outgoing);

        feed.send_text("pong").await.unwrap();
        assert_eq!(fx.backend.sent()[0].text, "pong");
        assert_eq!(outgoing.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejected_send_is_send_failed() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.open().await.unwrap();
        fx.backend.set_faults(Faults {
            send: true,
            ..Faults::default()
        });

        let err = feed.send_text("x").await.unwrap_err();
        assert!(matches!(err, Error::SendFailed { .. }));
    }

    #[tokio::test]
    async fn dropped_listener_stops_receiving() {
        let fx = fixture().await;
        let feed = fx.registry.get_feed(&FeedId::new("F1"));
        feed.open().await.unwrap();
        let (seen, sub) = collect(&feed, FeedEventKind::Incoming);
        assert_eq!(feed.listener_count(), 1);
        drop(sub);
        assert_eq!(feed.listener_count(), 0);

        fx.backend
            .inject_message(&fx.descriptor, FeedMessage::text("other", "hi"));
        assert!(seen.lock().unwrap().is_empty());
    }

    /// Client whose feed lookups park until `gate` is released.
    struct GatedClient {
        inner: Arc<dyn MessagingClient>,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    struct GatedCollection {
        inner: Arc<dyn Collection>,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    impl MessagingClient for GatedClient {
        fn enable(&self) {
            self.inner.enable();
        }

        fn disable(&self) {
            self.inner.disable();
        }

        fn state(&self) -> ClientState {
            self.inner.state()
        }

        fn store(&self) -> &dyn ObjectStore {
            self
        }

        fn messaging(&self) -> &dyn MessagingApi {
            self.inner.messaging()
        }

        fn identity(&self) -> &dyn IdentityApi {
            self.inner.identity()
        }

        fn feeds(&self) -> &dyn FeedApi {
            self.inner.feeds()
        }

        fn auth(&self) -> &dyn AuthApi {
            self.inner.auth()
        }
    }

    #[async_trait]
    impl ObjectStore for GatedClient {
        async fn collection(
            &self,
            name: CollectionName,
        ) -> feedlink_messaging::Result<Arc<dyn Collection>> {
            let inner = self.inner.store().collection(name.clone()).await?;
            if name != CollectionName::Feeds {
                return Ok(inner);
            }
            Ok(Arc::new(GatedCollection {
                inner,
                entered: Arc::clone(&self.entered),
                gate: Arc::clone(&self.gate),
            }))
        }
    }

    #[async_trait]
    impl Collection for GatedCollection {
        fn name(&self) -> &CollectionName {
            self.inner.name()
        }

        async fn get_by_key(&self, key: &str) -> feedlink_messaging::Result<Option<StoredObject>> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.get_by_key(key).await
        }

        async fn find(&self, query: &Value) -> feedlink_messaging::Result<Vec<StoredObject>> {
            self.inner.find(query).await
        }

        fn subscribe(&self, kind: ChangeKind, listener: ChangeListener) -> Subscription {
            self.inner.subscribe(kind, listener)
        }
    }

    #[tokio::test]
    async fn close_during_open_leaves_feed_closed() {
        let fx = fixture().await;
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let inner = fx
            .backend
            .create(ClientOptions {
                instance: "gated".into(),
                storage: Arc::new(MemoryCredentialStore::new()),
                sync: true,
                api_key: ApiKey::new("id", "secret"),
            })
            .unwrap();
        inner.enable();
        let client = Arc::new(GatedClient {
            inner,
            entered: Arc::clone(&entered),
            gate: Arc::clone(&gate),
        });
        let registry = FeedRegistry::new(client);
        registry.start().await.unwrap();
        let feed = registry.get_feed(&FeedId::new("F1"));

        let opening = tokio::spawn({
            let feed = Arc::clone(&feed);
            async move { feed.open().await }
        });
        entered.notified().await;
        assert_eq!(feed.state(), FeedState::Opening);
        feed.close().await.unwrap();
        gate.notify_one();

        let result = opening.await.unwrap();
        assert!(matches!(result, Err(Error::InvalidState { .. })));
        assert_eq!(feed.state(), FeedState::Closed);
        assert_eq!(
            fx.backend
                .listener_count(&CollectionName::FeedObjects(fx.descriptor.object_id.clone())),
            0
        );
        assert!(!registry.contains(&FeedId::new("F1")));
    }
}
