use feedlink_common::FeedId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("feed already open: {feed_id}")]
    AlreadyOpen { feed_id: FeedId },

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("send to feed {feed_id} failed: {source}")]
    SendFailed {
        feed_id: FeedId,
        #[source]
        source: feedlink_messaging::Error,
    },

    /// The accounts collection holds no record flagged `owned`.
    #[error("no owned account found in the accounts collection")]
    NoOwnAccount,

    #[error(transparent)]
    Messaging(#[from] feedlink_messaging::Error),
}

impl Error {
    #[must_use]
    pub fn not_found(what: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn already_open(feed_id: &FeedId) -> Self {
        Self::AlreadyOpen {
            feed_id: feed_id.clone(),
        }
    }

    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn send_failed(feed_id: &FeedId, source: feedlink_messaging::Error) -> Self {
        Self::SendFailed {
            feed_id: feed_id.clone(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
