//! Adapter trait definitions.
//!
//! - [`Bot`] -- outbound capabilities of one bot account on a platform
//! - [`Adapter`] -- implemented by each platform integration
//! - [`AdapterHost`] -- implemented by the runtime, consumed by adapters
//!   for delivering inbound sessions
//! - [`AdapterFactory`] -- builds adapters from JSON configuration

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chorus_core::{Context, Runtime};
use chorus_types::error::AdapterError;
use chorus_types::session::Session;

/// Prefix of the service name under which a platform's bot is published.
pub const BOT_SERVICE_PREFIX: &str = "bot:";

/// Service name for the bot of `platform`: `"bot:<platform>"`.
pub fn bot_service_name(platform: &str) -> String {
    format!("{BOT_SERVICE_PREFIX}{platform}")
}

/// Look up the bot published for `platform`.
pub fn bot_for(ctx: &Context, platform: &str) -> Option<Arc<dyn Bot>> {
    ctx.service::<Arc<dyn Bot>>(&bot_service_name(platform))
        .map(|bot| bot.as_ref().clone())
}

/// Lifecycle status of an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterStatus {
    /// Not yet started.
    Stopped,
    /// Connecting / logging in.
    Starting,
    /// Running and delivering sessions.
    Running,
    /// Encountered an error.
    Error(String),
    /// Shutting down.
    Stopping,
}

/// Identifier of a sent message, as returned by [`Bot::send_message`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

/// A member of a group, as reported by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Platform user id.
    pub user_id: String,
    /// Display name inside the group, if set.
    #[serde(default)]
    pub nickname: Option<String>,
    /// Platform roles or titles.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Outbound surface of one bot account.
#[async_trait]
pub trait Bot: Send + Sync {
    /// Platform this bot lives on.
    fn platform(&self) -> &str;

    /// The bot's own user id on the platform.
    fn self_id(&self) -> &str;

    /// Send `content` to a user or group channel.
    async fn send_message(&self, channel_id: &str, content: &str)
    -> Result<MessageId, AdapterError>;

    /// Fetch membership info of `user_id` in `group_id`.
    async fn get_member(&self, group_id: &str, user_id: &str) -> Result<Member, AdapterError>;
}

/// A connection to one chat platform.
///
/// 1. An [`AdapterFactory`] builds the adapter from config.
/// 2. The manager calls [`start`](Adapter::start) with an
///    `Arc<dyn AdapterHost>` and a [`CancellationToken`].
/// 3. `start` runs until the token is cancelled, handing every inbound
///    event to [`AdapterHost::deliver`].
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Platform identifier (e.g. `"telegram"`).
    fn platform(&self) -> &str;

    /// The bot account this adapter drives.
    fn bot(&self) -> Arc<dyn Bot>;

    /// Current lifecycle status.
    fn status(&self) -> AdapterStatus;

    /// Receive events until `cancel` fires.
    async fn start(
        &self,
        host: Arc<dyn AdapterHost>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError>;
}

/// Where adapters deliver normalized inbound sessions.
#[async_trait]
pub trait AdapterHost: Send + Sync {
    /// Dispatch one session; resolves to the middleware chain's result.
    async fn deliver(&self, session: Session) -> Result<Value, AdapterError>;
}

/// Builds [`Adapter`]s from their JSON config section.
pub trait AdapterFactory: Send + Sync {
    /// Platform the built adapters serve.
    fn platform(&self) -> &str;

    /// Build an adapter instance.
    fn build(&self, config: &Value) -> Result<Arc<dyn Adapter>, AdapterError>;
}

#[async_trait]
impl AdapterHost for Runtime {
    async fn deliver(&self, session: Session) -> Result<Value, AdapterError> {
        if session.platform.trim().is_empty() {
            return Err(AdapterError::InvalidSession("missing platform".into()));
        }
        if session.user_id.trim().is_empty() {
            return Err(AdapterError::InvalidSession("missing user id".into()));
        }
        debug!(
            runtime = %self.id(),
            platform = %session.platform,
            event = %session.event,
            "delivering session"
        );
        Ok(Runtime::deliver(self, session).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_service_names_are_prefixed() {
        assert_eq!(bot_service_name("telegram"), "bot:telegram");
    }

    #[test]
    fn member_deserializes_with_defaults() {
        let m: Member = serde_json::from_str(r#"{"user_id": "42"}"#).unwrap();
        assert_eq!(m.user_id, "42");
        assert!(m.nickname.is_none());
        assert!(m.roles.is_empty());
    }

    #[test]
    fn adapter_status_equality() {
        assert_eq!(AdapterStatus::Running, AdapterStatus::Running);
        assert_ne!(
            AdapterStatus::Error("a".into()),
            AdapterStatus::Error("b".into())
        );
    }

    #[tokio::test]
    async fn runtime_rejects_sessions_without_identity() {
        let runtime = Runtime::default();
        let host: &dyn AdapterHost = &runtime;

        let err = host.deliver(Session::private("", "42")).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidSession(_)));

        let err = host.deliver(Session::private("telegram", " ")).await.unwrap_err();
        assert!(matches!(err, AdapterError::InvalidSession(_)));
    }

    #[tokio::test]
    async fn runtime_delivers_to_middleware() {
        let runtime = Runtime::default();
        runtime
            .root()
            .middleware(
                chorus_core::Middleware::new(|session, _next| async move {
                    Ok(Value::String(format!("echo: {}", session.content)))
                }),
                false,
            )
            .unwrap();

        let host: Arc<dyn AdapterHost> = Arc::new(runtime);
        let out = host
            .deliver(Session::private("telegram", "42").with_content("hi"))
            .await
            .unwrap();
        assert_eq!(out, Value::String("echo: hi".into()));
    }
}
