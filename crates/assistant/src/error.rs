use std::error::Error as StdError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The linking handshake was rejected or could not be carried out.
    #[error("linking handshake failed: {message}")]
    HandshakeFailed { message: String },

    /// No credentials have been provisioned yet.
    #[error("assistant manager is not initialized")]
    NotInitialized,

    /// The operation needs a running messaging client.
    #[error("assistant manager is not running")]
    NotRunning,

    /// Another linking handshake is in flight.
    #[error("a linking handshake is already in progress")]
    LinkInProgress,

    #[error("binding for {user_id} is already started")]
    AlreadyStarted { user_id: String },

    /// The feed is already bound to another user's engine.
    #[error("feed {feed_id} is already bound to {user_id}")]
    FeedInUse { feed_id: String, user_id: String },

    #[error(transparent)]
    Feeds(#[from] feedlink_feeds::Error),

    #[error(transparent)]
    Messaging(#[from] feedlink_messaging::Error),

    #[error(transparent)]
    Config(#[from] feedlink_config::Error),

    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn handshake_failed(message: impl std::fmt::Display) -> Self {
        Self::HandshakeFailed {
            message: message.to_string(),
        }
    }

    /// Wrap an error reported by an engine.
    #[must_use]
    pub fn engine(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::External {
            context: context.into(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
