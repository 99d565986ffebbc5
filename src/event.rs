//! Inbound chat events.
//!
//! An `Event` is created once per inbound message by the stream source, consumed
//! by a single dispatcher pass and then discarded. It is never mutated.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Platform user id.
    pub id: String,
    /// Display name, when the platform provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Message was sent by a bot account.
    #[serde(default, alias = "bot")]
    pub is_bot: bool,
    /// Message was sent by the platform itself.
    #[serde(default, alias = "system")]
    pub is_system: bool,
}

impl Author {
    /// A regular human author.
    #[must_use]
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            is_bot: false,
            is_system: false,
        }
    }

    /// A bot author.
    #[must_use]
    pub fn bot(id: impl Into<String>) -> Self {
        Self {
            is_bot: true,
            ..Self::user(id)
        }
    }

    /// True for bot and system accounts.
    #[must_use]
    pub const fn is_automated(&self) -> bool {
        self.is_bot || self.is_system
    }
}

/// One inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Platform message id.
    pub id: String,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    #[serde(alias = "channelId")]
    pub channel_id: String,
    /// Users mentioned by the message.
    #[serde(default, alias = "mentionedUserIds")]
    pub mentioned_user_ids: BTreeSet<String>,
    /// Role ids of the author in the message's guild.
    ///
    /// `None` when the platform cannot resolve the member (e.g. direct messages).
    #[serde(default, alias = "authorRoleIds", skip_serializing_if = "Option::is_none")]
    pub author_role_ids: Option<BTreeSet<String>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Creates an event with no mentions and unresolved author roles.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        author: Author,
        channel_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author,
            content: content.into(),
            channel_id: channel_id.into(),
            mentioned_user_ids: BTreeSet::new(),
            author_role_ids: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the author's role ids.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.author_role_ids = Some(roles.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a mentioned user id.
    #[must_use]
    pub fn mentioning(mut self, user_id: impl Into<String>) -> Self {
        self.mentioned_user_ids.insert(user_id.into());
        self
    }

    /// Returns true if `user_id` is among the mentioned users.
    #[must_use]
    pub fn mentions(&self, user_id: &str) -> bool {
        self.mentioned_user_ids.contains(user_id)
    }
}
