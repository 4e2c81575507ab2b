//! Binds per-user automation engines to conversation feeds.
//!
//! The [`AssistantManager`] owns the one shared messaging client, the
//! [`FeedRegistry`](feedlink_feeds::FeedRegistry) built on it, and one
//! [`EngineBinding`] per registered user while the client runs. The two-phase
//! linking handshake that provisions the client's credentials lives in
//! [`link`].

pub mod binding;
pub mod engine;
pub mod error;
pub mod link;
pub mod manager;

pub use {
    binding::EngineBinding,
    engine::{AssistantEngine, AssistantReceiver},
    error::{Error, Result},
    link::{CODE_PARAM, HANDSHAKE_SESSION_KEY, LINK_KEY_PARAM, LinkSession},
    manager::{AssistantManager, LinkState, ManagerOptions},
};
