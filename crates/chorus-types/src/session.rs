//! Normalized inbound session values.
//!
//! A [`Session`] is what a platform adapter hands to the runtime: one
//! inbound event (a message, a member joining, a friend request...)
//! reduced to the fields every plugin can rely on. Sessions are
//! immutable once delivered; the runtime shares them as `Arc<Session>`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The event name used for ordinary chat messages.
pub const MESSAGE_EVENT: &str = "message";

/// Kind of conversation a session belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// One-to-one conversation with a user.
    Private,
    /// Multi-user conversation (group, guild channel, room).
    Group,
}

impl SessionKind {
    /// Every kind, in canonical order.
    pub const ALL: [SessionKind; 2] = [SessionKind::Private, SessionKind::Group];

    /// Position of this kind in [`SessionKind::ALL`].
    pub fn index(self) -> usize {
        match self {
            SessionKind::Private => 0,
            SessionKind::Group => 1,
        }
    }

    /// Lowercase name, as used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Private => "private",
            SessionKind::Group => "group",
        }
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique id of this session (platform message id or a generated UUID).
    pub id: String,

    /// Platform identifier (e.g. `"telegram"`, `"discord"`).
    pub platform: String,

    /// Conversation kind.
    pub kind: SessionKind,

    /// Event name this session is dispatched under.
    #[serde(default = "default_event")]
    pub event: String,

    /// Id of the user who triggered the event.
    #[serde(alias = "userId")]
    pub user_id: String,

    /// Id of the group/channel, for group sessions.
    #[serde(default, alias = "groupId")]
    pub group_id: Option<String>,

    /// Id of the bot account that received the event.
    #[serde(default, alias = "selfId")]
    pub self_id: String,

    /// Display name of the author, when the platform provides one.
    #[serde(default)]
    pub author: Option<String>,

    /// Message text.
    #[serde(default)]
    pub content: String,

    /// Platform-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// When the event was received.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

fn default_event() -> String {
    MESSAGE_EVENT.to_string()
}

impl Session {
    /// A private message from `user_id` on `platform`.
    pub fn private(platform: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform: platform.into(),
            kind: SessionKind::Private,
            event: default_event(),
            user_id: user_id.into(),
            group_id: None,
            self_id: String::new(),
            author: None,
            content: String::new(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// A group message from `user_id` in `group_id` on `platform`.
    pub fn group(
        platform: impl Into<String>,
        group_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: SessionKind::Group,
            group_id: Some(group_id.into()),
            ..Self::private(platform, user_id)
        }
    }

    /// Set the message text.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the event name.
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    /// Set the receiving bot's id.
    pub fn with_self_id(mut self, self_id: impl Into<String>) -> Self {
        self.self_id = self_id.into();
        self
    }

    /// Set the platform payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// The identifier scopes select on: the user for private sessions,
    /// the group for group sessions.
    pub fn subject_id(&self) -> &str {
        match self.kind {
            SessionKind::Private => &self.user_id,
            SessionKind::Group => self.group_id.as_deref().unwrap_or(""),
        }
    }

    /// Whether this session is an ordinary chat message.
    pub fn is_message(&self) -> bool {
        self.event == MESSAGE_EVENT
    }

    /// Stable key for per-conversation side tables: `"{platform}:{kind}:{subject}"`.
    pub fn conversation_key(&self) -> String {
        format!("{}:{}:{}", self.platform, self.kind, self.subject_id())
    }
}
