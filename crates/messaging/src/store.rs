//! Replicated object store: named collections with point lookup, queries,
//! and change events.

use std::{fmt, sync::Arc};

use {async_trait::async_trait, feedlink_common::ObjectId, serde_json::Value};

use crate::{Result, subscription::Subscription};

/// Collections exposed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionName {
    /// Every feed the local account belongs to, keyed by feed identifier.
    Feeds,
    /// Known accounts; the local one is flagged `owned`.
    Accounts,
    /// Messages of one feed, addressed by the feed's object id.
    FeedObjects(ObjectId),
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feeds => f.write_str("feeds"),
            Self::Accounts => f.write_str("accounts"),
            Self::FeedObjects(id) => write!(f, "feed-objects/{id}"),
        }
    }
}

/// Kind of change applied to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A document held in a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// Store-wide object id.
    pub id: ObjectId,
    /// Lookup key inside the owning collection.
    pub key: String,
    pub body: Value,
}

impl StoredObject {
    /// True when every top-level field of `query` equals the same field in the body.
    pub fn matches(&self, query: &Value) -> bool {
        match query.as_object() {
            Some(fields) => fields
                .iter()
                .all(|(name, expected)| self.body.get(name) == Some(expected)),
            None => false,
        }
    }
}

/// Callback invoked with the object a change applied to.
pub type ChangeListener = Arc<dyn Fn(&StoredObject) + Send + Sync>;

/// One replicated collection.
///
/// Listeners for a collection are called in the order the store applies
/// changes locally.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &CollectionName;

    async fn get_by_key(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Objects whose body matches every field of `query` (see [`StoredObject::matches`]).
    async fn find(&self, query: &Value) -> Result<Vec<StoredObject>>;

    /// Register `listener` for changes of `kind`.
    fn subscribe(&self, kind: ChangeKind, listener: ChangeListener) -> Subscription;
}

/// Access to the store's collections.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn collection(&self, name: CollectionName) -> Result<Arc<dyn Collection>>;

    async fn feeds(&self) -> Result<Arc<dyn Collection>> {
        self.collection(CollectionName::Feeds).await
    }

    async fn accounts(&self) -> Result<Arc<dyn Collection>> {
        self.collection(CollectionName::Accounts).await
    }

    async fn feed_objects(&self, feed_object_id: &ObjectId) -> Result<Arc<dyn Collection>> {
        self.collection(CollectionName::FeedObjects(feed_object_id.clone()))
            .await
    }
}
