//! Shared identifiers and error helpers used across the feedlink crates.

pub mod error;
pub mod types;

pub use {
    error::FromMessage,
    types::{FeedId, ObjectId, UserId},
};
