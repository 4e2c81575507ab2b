use std::error::Error as StdError;

/// Crate-wide result type for messaging operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by messaging clients and credential stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The client is not enabled.
    #[error("messaging client is disabled")]
    Disabled,

    /// The service refused the request.
    #[error("messaging service rejected request: {message}")]
    Rejected { message: String },

    /// The auth sub-API refused a link request or confirmation.
    #[error("authorization failed: {message}")]
    Auth { message: String },

    /// A stored object could not be decoded into the expected record.
    #[error("invalid object in {collection}: {message}")]
    InvalidObject { collection: String, message: String },

    /// Wrapped source error from the transport or persistence layer.
    #[error("messaging operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn rejected(message: impl std::fmt::Display) -> Self {
        Self::Rejected {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn auth(message: impl std::fmt::Display) -> Self {
        Self::Auth {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_object(
        collection: impl std::fmt::Display,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidObject {
            collection: collection.to_string(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
