//! Conversation feeds on top of the replicated store.
//!
//! A [`Feed`] wraps one conversation and turns store inserts into typed
//! message events. The [`FeedRegistry`] owns every live `Feed` of one
//! messaging client, keyed by feed identifier, and keeps them in step with
//! the global `feeds` collection.

pub mod error;
pub mod feed;
pub mod registry;

pub use {
    error::{Error, Result},
    feed::{Feed, FeedEventKind, FeedState, MessageListener},
    registry::FeedRegistry,
};
