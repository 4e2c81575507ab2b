//! Typed views of the documents kept in the store.

use {
    feedlink_common::{FeedId, ObjectId},
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result, store::StoredObject};

/// Descriptor of a feed as kept in the `feeds` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedDescriptor {
    pub identifier: FeedId,
    /// Object id addressing the feed's message collection.
    pub object_id: ObjectId,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl FeedDescriptor {
    pub fn from_object(obj: &StoredObject) -> Result<Self> {
        serde_json::from_value(obj.body.clone())
            .map_err(|e| Error::invalid_object("feeds", format!("{}: {e}", obj.key)))
    }
}

/// A message in a feed's object collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMessage {
    pub sender_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Machine-to-machine signalling, not meant for display or commands.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl FeedMessage {
    pub const TEXT: &'static str = "text";

    pub fn text(sender_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            kind: Self::TEXT.into(),
            text: Some(text.into()),
            hidden: false,
            timestamp: None,
        }
    }

    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn is_text(&self) -> bool {
        self.kind == Self::TEXT
    }

    pub fn from_object(obj: &StoredObject) -> Result<Self> {
        serde_json::from_value(obj.body.clone())
            .map_err(|e| Error::invalid_object("feed-objects", format!("{}: {e}", obj.key)))
    }
}

/// An entry of the `accounts` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(default)]
    pub owned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
