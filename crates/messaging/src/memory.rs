//! In-process messaging service.
//!
//! [`MemoryBackend`] plays the remote service: every client it creates shares
//! one replicated store, so a throwaway handshake client and the long-lived
//! shared client observe the same accounts and feeds. Changes are applied and
//! announced synchronously, in call order.
//!
//! The linking flow is a loopback: an authorization page is approved on the
//! spot, so the returned link points straight back at the return address with
//! the handshake key and an authorization code in its query.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    feedlink_common::{FeedId, ObjectId},
    serde_json::{Value, json},
    tokio::sync::watch,
    tracing::{debug, info},
    url::Url,
};

use crate::{
    Error, Result,
    client::{
        AuthApi, AuthPage, ClientFactory, ClientOptions, ClientState, FeedApi, IdentityApi,
        MessagingApi, MessagingClient,
    },
    credentials::CREDENTIALS_KEY,
    records::{AccountRecord, FeedDescriptor, FeedMessage},
    store::{ChangeKind, ChangeListener, Collection, CollectionName, ObjectStore, StoredObject},
    subscription::Subscription,
};

/// Failures the backend should simulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    pub send: bool,
    pub contacts: bool,
    pub create_feed: bool,
    pub auth_page: bool,
}

/// A text delivered through [`MessagingApi::send_text_to_feed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentText {
    pub feed_id: FeedId,
    pub text: String,
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

// ── Collections ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    entries: Vec<(u64, ChangeKind, ChangeListener)>,
}

/// A collection held in memory.
pub struct MemoryCollection {
    name: CollectionName,
    objects: Mutex<Vec<StoredObject>>,
    listeners: Arc<Mutex<ListenerSet>>,
}

impl MemoryCollection {
    fn new(name: CollectionName) -> Self {
        Self {
            name,
            objects: Mutex::new(Vec::new()),
            listeners: Arc::new(Mutex::new(ListenerSet::default())),
        }
    }

    /// Insert `obj`, or replace the object with the same key.
    pub fn upsert(&self, obj: StoredObject) -> ChangeKind {
        let kind = {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            match objects.iter_mut().find(|o| o.key == obj.key) {
                Some(existing) => {
                    *existing = obj.clone();
                    ChangeKind::Update
                },
                None => {
                    objects.push(obj.clone());
                    ChangeKind::Insert
                },
            }
        };
        self.emit(kind, &obj);
        kind
    }

    pub fn delete(&self, key: &str) -> Option<StoredObject> {
        let removed = {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            let idx = objects.iter().position(|o| o.key == key)?;
            objects.remove(idx)
        };
        self.emit(ChangeKind::Delete, &removed);
        Some(removed)
    }

    /// Number of registered listeners, across all change kinds.
    pub fn listener_count(&self) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.entries.len()
    }

    fn snapshot(&self) -> Vec<StoredObject> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.clone()
    }

    fn emit(&self, kind: ChangeKind, obj: &StoredObject) {
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let targets: Vec<ChangeListener> = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .entries
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, l)| Arc::clone(l))
                .collect()
        };
        for listener in targets {
            listener(obj);
        }
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &CollectionName {
        &self.name
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<StoredObject>> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects.iter().find(|o| o.key == key).cloned())
    }

    async fn find(&self, query: &Value) -> Result<Vec<StoredObject>> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(|o| o.matches(query))
            .collect())
    }

    fn subscribe(&self, kind: ChangeKind, listener: ChangeListener) -> Subscription {
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
}

// ── Shared service state ────────────────────────────────────────────────────

#[derive(Default)]
struct Service {
    collections: Mutex<HashMap<CollectionName, Arc<MemoryCollection>>>,
    contacts: Mutex<Vec<String>>,
    sent: Mutex<Vec<SentText>>,
    /// Handshake key → authorization code.
    pending_links: Mutex<HashMap<String, String>>,
    faults: Mutex<Faults>,
    clients_created: AtomicUsize,
    enabled_clients: AtomicUsize,
}

impl Service {
    fn collection(&self, name: &CollectionName) -> Arc<MemoryCollection> {
        let mut collections = self.collections.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            collections
                .entry(name.clone())
                .or_insert_with(|| Arc::new(MemoryCollection::new(name.clone()))),
        )
    }

    fn faults(&self) -> Faults {
        *self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn owned_account(&self) -> Option<ObjectId> {
        self.collection(&CollectionName::Accounts)
            .snapshot()
            .into_iter()
            .find(|o| o.matches(&json!({ "owned": true })))
            .map(|o| o.id)
    }

    fn add_account(&self, name: &str, owned: bool) -> ObjectId {
        let id = ObjectId::new(new_id("acc"));
        let record = AccountRecord {
            owned,
            name: Some(name.to_string()),
        };
        self.collection(&CollectionName::Accounts)
            .upsert(StoredObject {
                id: id.clone(),
                key: id.to_string(),
                body: json!(record),
            });
        id
    }

    fn put_feed(&self, feed: &FeedDescriptor) {
        self.collection(&CollectionName::Feeds).upsert(StoredObject {
            id: feed.object_id.clone(),
            key: feed.identifier.to_string(),
            body: json!(feed),
        });
    }

    fn append_message(&self, feed_object_id: &ObjectId, message: &FeedMessage) {
        let id = ObjectId::new(new_id("msg"));
        self.collection(&CollectionName::FeedObjects(feed_object_id.clone()))
            .upsert(StoredObject {
                id: id.clone(),
                key: id.to_string(),
                body: json!(message),
            });
    }
}

// ── Backend (factory + test controls) ───────────────────────────────────────

/// The in-process service and a [`ClientFactory`] for it.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    service: Arc<Service>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The owned account, created on first call.
    pub fn own_account(&self, name: &str) -> ObjectId {
        match self.service.owned_account() {
            Some(id) => id,
            None => self.service.add_account(name, true),
        }
    }

    /// Add a counterparty account.
    pub fn add_account(&self, name: &str) -> ObjectId {
        self.service.add_account(name, false)
    }

    /// Add (or replace) a feed with the given identifier.
    pub fn add_feed(&self, identifier: &str, members: &[&str]) -> FeedDescriptor {
        let feed = FeedDescriptor {
            identifier: FeedId::new(identifier),
            object_id: ObjectId::new(new_id("feedobj")),
            members: members.iter().map(|m| m.to_string()).collect(),
            name: None,
        };
        self.service.put_feed(&feed);
        feed
    }

    /// Replace a feed's descriptor, announcing an update.
    pub fn update_feed(&self, feed: &FeedDescriptor) {
        self.service.put_feed(feed);
    }

    /// Remove a feed, announcing a delete.
    pub fn remove_feed(&self, identifier: &str) -> bool {
        self.service
            .collection(&CollectionName::Feeds)
            .delete(identifier)
            .is_some()
    }

    /// Append a message to a feed as if it had been replicated from the network.
    pub fn inject_message(&self, feed: &FeedDescriptor, message: FeedMessage) {
        self.service.append_message(&feed.object_id, &message);
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.service
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn contacts(&self) -> Vec<String> {
        self.service
            .contacts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.service.faults.lock().unwrap_or_else(|e| e.into_inner()) = faults;
    }

    /// Listeners currently registered on `name`.
    pub fn listener_count(&self, name: &CollectionName) -> usize {
        self.service.collection(name).listener_count()
    }

    /// Number of feeds in the `feeds` collection.
    pub fn feed_count(&self) -> usize {
        self.service
            .collection(&CollectionName::Feeds)
            .snapshot()
            .len()
    }

    pub fn clients_created(&self) -> usize {
        self.service.clients_created.load(Ordering::SeqCst)
    }

    /// Clients currently enabled.
    pub fn enabled_clients(&self) -> usize {
        self.service.enabled_clients.load(Ordering::SeqCst)
    }

    pub fn pending_links(&self) -> usize {
        self.service
            .pending_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl ClientFactory for MemoryBackend {
    fn create(&self, options: ClientOptions) -> Result<Arc<dyn MessagingClient>> {
        self.service.clients_created.fetch_add(1, Ordering::SeqCst);
        debug!(instance = %options.instance, sync = options.sync, "creating in-memory client");
        let (signed_up, _) = watch::channel(false);
        Ok(Arc::new(MemoryClient {
            service: Arc::clone(&self.service),
            options,
            state: Mutex::new(ClientState::Idle),
            signed_up,
        }))
    }
}

// ── Client ──────────────────────────────────────────────────────────────────

/// A client handle on a [`MemoryBackend`].
pub struct MemoryClient {
    service: Arc<Service>,
    options: ClientOptions,
    state: Mutex<ClientState>,
    signed_up: watch::Sender<bool>,
}

impl MemoryClient {
    fn ensure_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    fn provision(&self) -> Result<ObjectId> {
        let account = match self.service.owned_account() {
            Some(id) => id,
            None => self.service.add_account(&self.options.instance, true),
        };
        let blob = json!({ "account": account, "instance": self.options.instance });
        self.options
            .storage
            .set(CREDENTIALS_KEY, serde_json::to_string(&blob)?)?;
        Ok(account)
    }
}

impl MessagingClient for MemoryClient {
    fn enable(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ClientState::Enabled {
            *state = ClientState::Enabled;
            self.service.enabled_clients.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn disable(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ClientState::Enabled {
            self.service.enabled_clients.fetch_sub(1, Ordering::SeqCst);
        }
        *state = ClientState::Disabled;
    }

    fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self) -> &dyn ObjectStore {
        self
    }

    fn messaging(&self) -> &dyn MessagingApi {
        self
    }

    fn identity(&self) -> &dyn IdentityApi {
        self
    }

    fn feeds(&self) -> &dyn FeedApi {
        self
    }

    fn auth(&self) -> &dyn AuthApi {
        self
    }
}

#[async_trait]
impl ObjectStore for MemoryClient {
    async fn collection(&self, name: CollectionName) -> Result<Arc<dyn Collection>> {
        self.ensure_enabled()?;
        Ok(self.service.collection(&name))
    }
}

#[async_trait]
impl MessagingApi for MemoryClient {
    async fn send_text_to_feed(&self, feed: &FeedDescriptor, text: &str) -> Result<()> {
        self.ensure_enabled()?;
        if self.service.faults().send {
            return Err(Error::rejected("delivery refused"));
        }
        let sender = self
            .service
            .owned_account()
            .ok_or_else(|| Error::rejected("no owned account"))?;

        self.service
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentText {
                feed_id: feed.identifier.clone(),
                text: text.to_string(),
            });
        // Local echo, as the replicated store would apply it.
        self.service
            .append_message(&feed.object_id, &FeedMessage::text(sender.as_str(), text));
        Ok(())
    }
}

#[async_trait]
impl IdentityApi for MemoryClient {
    async fn add_account_to_contacts(&self, contact_id: &str) -> Result<()> {
        self.ensure_enabled()?;
        if self.service.faults().contacts {
            return Err(Error::rejected("contact service unreachable"));
        }
        if contact_id.trim().is_empty() {
            return Err(Error::rejected("invalid contact id"));
        }
        let mut contacts = self
            .service
            .contacts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !contacts.iter().any(|c| c == contact_id) {
            contacts.push(contact_id.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl FeedApi for MemoryClient {
    async fn get_or_create_feed_with_members(
        &self,
        members: &[String],
    ) -> Result<(FeedDescriptor, bool)> {
        self.ensure_enabled()?;
        if self.service.faults().create_feed {
            return Err(Error::rejected("feed creation refused"));
        }

        let mut wanted = members.to_vec();
        wanted.sort();

        for obj in self.service.collection(&CollectionName::Feeds).snapshot() {
            let feed = FeedDescriptor::from_object(&obj)?;
            let mut have = feed.members.clone();
            have.sort();
            if have == wanted {
                return Ok((feed, true));
            }
        }

        let feed = FeedDescriptor {
            identifier: FeedId::new(new_id("feed")),
            object_id: ObjectId::new(new_id("feedobj")),
            members: members.to_vec(),
            name: None,
        };
        self.service.put_feed(&feed);
        Ok((feed, false))
    }
}

#[async_trait]
impl AuthApi for MemoryClient {
    async fn get_auth_page(&self, return_url: &Url, scopes: &[String]) -> Result<AuthPage> {
        self.ensure_enabled()?;
        if self.service.faults().auth_page {
            return Err(Error::auth("authorization page unavailable"));
        }

        let key = new_id("k");
        let code = new_id("code");
        self.service
            .pending_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), code.clone());

        let mut link = return_url.clone();
        link.query_pairs_mut()
            .append_pair("k", &key)
            .append_pair("code", &code)
            .append_pair("scope", &scopes.join(" "));
        Ok(AuthPage { link })
    }

    async fn confirm_auth(&self, code: &str, key: &str) -> Result<()> {
        self.ensure_enabled()?;
        let expected = self
            .service
            .pending_links
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .ok_or_else(|| Error::auth("unknown handshake key"))?;
        if expected != code {
            return Err(Error::auth("authorization code rejected"));
        }

        let account = self.provision()?;
        info!(account = %account, instance = %self.options.instance, "account signed up");
        self.signed_up.send_replace(true);
        Ok(())
    }

    async fn signed_up(&self) -> Result<()> {
        let mut rx = self.signed_up.subscribe();
        rx.wait_for(|done| *done)
            .await
            .map_err(|e| Error::external("signed-up signal", e))?;
        Ok(())
    }
}
