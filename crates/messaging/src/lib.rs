//! Interfaces of the external messaging service consumed by feedlink.
//!
//! A [`MessagingClient`] is a handle to the federated messaging service: an
//! enable/disable lifecycle, a replicated [`ObjectStore`] with change events,
//! and the messaging, identity, feed and auth sub-APIs. Clients are built by a
//! [`ClientFactory`] over a [`CredentialStore`] that persists whatever the
//! service provisions during linking.
//!
//! The [`memory`] module provides an in-process implementation used by tests
//! and local runs.

pub mod client;
pub mod credentials;
pub mod error;
pub mod memory;
pub mod records;
pub mod store;
pub mod subscription;

pub use {
    client::{
        ApiKey, AuthApi, AuthPage, ClientFactory, ClientOptions, ClientState, FeedApi, IdentityApi,
        MessagingApi, MessagingClient, ScopedEnable,
    },
    credentials::{
        CREDENTIALS_KEY, CredentialStore, FileCredentialStore, MemoryCredentialStore,
        has_credentials,
    },
    error::{Error, Result},
    records::{AccountRecord, FeedDescriptor, FeedMessage},
    store::{ChangeKind, ChangeListener, Collection, CollectionName, ObjectStore, StoredObject},
    subscription::Subscription,
};
