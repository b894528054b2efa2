//! Adapter lifecycle against a real runtime, using an in-memory platform.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chorus_channels::{
    Adapter, AdapterError, AdapterFactory, AdapterHost, AdapterManager, AdapterStatus, Bot,
    Member, MessageId, bot_for,
};
use chorus_core::{ForkState, Middleware, PluginFn, Runtime, Session};

const STATUS_STOPPED: u8 = 0;
const STATUS_RUNNING: u8 = 1;

#[derive(Default)]
struct MockBot {
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Bot for MockBot {
    fn platform(&self) -> &str {
        "mock"
    }

    fn self_id(&self) -> &str {
        "bot-1"
    }

    async fn send_message(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageId, AdapterError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((channel_id.to_owned(), content.to_owned()));
        Ok(MessageId(format!("mock-msg-{}", sent.len())))
    }

    async fn get_member(&self, _group_id: &str, user_id: &str) -> Result<Member, AdapterError> {
        Ok(Member {
            user_id: user_id.to_owned(),
            nickname: None,
            roles: vec![],
        })
    }
}

/// Delivers the configured inbound texts, reports each result, then idles.
struct MockAdapter {
    bot: Arc<MockBot>,
    inbound: Vec<String>,
    results: mpsc::UnboundedSender<Result<Value, String>>,
    status_byte: AtomicU8,
}

#[async_trait]
impl Adapter for MockAdapter {
    fn platform(&self) -> &str {
        "mock"
    }

    fn bot(&self) -> Arc<dyn Bot> {
        self.bot.clone()
    }

    fn status(&self) -> AdapterStatus {
        match self.status_byte.load(Ordering::SeqCst) {
            STATUS_RUNNING => AdapterStatus::Running,
            _ => AdapterStatus::Stopped,
        }
    }

    async fn start(
        &self,
        host: Arc<dyn AdapterHost>,
        cancel: CancellationToken,
    ) -> Result<(), AdapterError> {
        self.status_byte.store(STATUS_RUNNING, Ordering::SeqCst);
        for text in &self.inbound {
            let session = Session::private("mock", "42")
                .with_self_id("bot-1")
                .with_content(text.as_str());
            let result = host.deliver(session).await.map_err(|e| e.to_string());
            let _ = self.results.send(result);
        }
        cancel.cancelled().await;
        self.status_byte.store(STATUS_STOPPED, Ordering::SeqCst);
        Ok(())
    }
}

struct MockFactory {
    bot: Arc<MockBot>,
    results: mpsc::UnboundedSender<Result<Value, String>>,
}

impl AdapterFactory for MockFactory {
    fn platform(&self) -> &str {
        "mock"
    }

    fn build(&self, config: &Value) -> Result<Arc<dyn Adapter>, AdapterError> {
        let inbound = config
            .get("inbound")
            .and_then(Value::as_array)
            .ok_or_else(|| AdapterError::ConfigInvalid("missing inbound".into()))?
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect();
        Ok(Arc::new(MockAdapter {
            bot: self.bot.clone(),
            inbound,
            results: self.results.clone(),
            status_byte: AtomicU8::new(STATUS_STOPPED),
        }))
    }
}

type Results = mpsc::UnboundedReceiver<Result<Value, String>>;

/// A runtime, a manager delivering into it, and a registered mock factory.
async fn setup() -> (Runtime, AdapterManager, Arc<MockBot>, Results) {
    let runtime = Runtime::default();
    let manager = AdapterManager::for_runtime(&runtime);
    let bot = Arc::new(MockBot::default());
    let (tx, rx) = mpsc::unbounded_channel();
    manager
        .register_factory(Arc::new(MockFactory {
            bot: bot.clone(),
            results: tx,
        }))
        .await;
    (runtime, manager, bot, rx)
}

fn echo_plugin() -> PluginFn {
    PluginFn::new("echo", |ctx, _| {
        let replies = ctx.clone();
        ctx.middleware(
            Middleware::new(move |session, _next| {
                let ctx = replies.clone();
                async move {
                    let reply = format!("echo: {}", session.content);
                    if let Some(bot) = bot_for(&ctx, &session.platform) {
                        bot.send_message(&session.user_id, &reply)
                            .await
                            .map_err(|e| chorus_core::HookError::failed(e.to_string()))?;
                    }
                    Ok::<_, chorus_core::HookError>(Value::String(reply))
                }
            }),
            false,
        )?;
        Ok(())
    })
    .requires("bot:mock")
}

#[tokio::test]
async fn unknown_platform_is_not_found() {
    let (_runtime, manager, _bot, _rx) = setup().await;
    let err = manager.init_adapter("irc", &json!({})).await.unwrap_err();
    assert!(matches!(err, AdapterError::NotFound(_)));
    assert!(matches!(
        manager.start_adapter("irc").await,
        Err(AdapterError::NotFound(_))
    ));
    assert!(matches!(
        manager.stop_adapter("irc").await,
        Err(AdapterError::NotFound(_))
    ));
}

#[tokio::test]
async fn bad_config_is_rejected_by_factory() {
    let (_runtime, manager, _bot, _rx) = setup().await;
    let err = manager.init_adapter("mock", &json!({})).await.unwrap_err();
    assert!(matches!(err, AdapterError::ConfigInvalid(_)));
    assert_eq!(manager.status("mock").await, None);
    assert!(!manager.is_running("mock").await);
}

#[tokio::test]
async fn exposing_bots_activates_dependent_plugins() {
    let (runtime, manager, _bot, _rx) = setup().await;
    let echo = runtime
        .root()
        .plugin(Arc::new(echo_plugin()), Value::Null)
        .unwrap();
    assert_eq!(echo.state(), ForkState::Pending);

    manager
        .init_adapter("mock", &json!({"inbound": []}))
        .await
        .unwrap();
    assert_eq!(manager.expose_bots(&runtime).await.unwrap(), 1);
    assert_eq!(echo.state(), ForkState::Active);
    assert!(runtime.root().has_service("bot:mock"));

    // Already published on this runtime.
    assert_eq!(manager.expose_bots(&runtime).await.unwrap(), 0);
    assert_eq!(manager.attached_runtimes().await, vec![runtime.id()]);
}

#[tokio::test]
async fn inbound_sessions_flow_through_middleware_and_back_out() {
    let (runtime, manager, bot, mut rx) = setup().await;
    runtime
        .root()
        .plugin(Arc::new(echo_plugin()), Value::Null)
        .unwrap();
    manager
        .init_adapter("mock", &json!({"inbound": ["hi", "there"]}))
        .await
        .unwrap();
    manager.expose_bots(&runtime).await.unwrap();

    assert_eq!(manager.start_all().await, 1);
    assert!(manager.is_running("mock").await);

    assert_eq!(rx.recv().await.unwrap(), Ok(json!("echo: hi")));
    assert_eq!(rx.recv().await.unwrap(), Ok(json!("echo: there")));
    assert_eq!(manager.status("mock").await, Some(AdapterStatus::Running));

    let sent = bot.sent.lock().unwrap().clone();
    assert_eq!(
        sent,
        vec![
            ("42".to_owned(), "echo: hi".to_owned()),
            ("42".to_owned(), "echo: there".to_owned()),
        ]
    );

    let id = manager
        .send_message("mock", "7", "broadcast")
        .await
        .unwrap();
    assert_eq!(id, MessageId("mock-msg-3".into()));

    assert_eq!(manager.shutdown().await, 1);
    assert!(!manager.is_running("mock").await);
    assert_eq!(manager.status("mock").await, Some(AdapterStatus::Stopped));
}

#[tokio::test]
async fn starting_twice_is_a_noop() {
    let (_runtime, manager, _bot, _rx) = setup().await;
    manager
        .init_adapter("mock", &json!({"inbound": []}))
        .await
        .unwrap();
    assert!(manager.start_adapter("mock").await.unwrap());
    assert!(!manager.start_adapter("mock").await.unwrap());
    assert_eq!(manager.start_all().await, 0);
    manager.stop_adapter("mock").await.unwrap();
    assert!(manager.stop_adapter("mock").await.is_err());
    assert_eq!(manager.shutdown().await, 0);
}

#[tokio::test]
async fn withdrawing_bot_service_deactivates_plugins() {
    let (runtime, manager, _bot, _rx) = setup().await;
    let echo = runtime
        .root()
        .plugin(Arc::new(echo_plugin()), Value::Null)
        .unwrap();
    manager
        .init_adapter("mock", &json!({"inbound": []}))
        .await
        .unwrap();
    manager.expose_bots(&runtime).await.unwrap();
    assert_eq!(echo.state(), ForkState::Active);

    assert!(runtime.root().unprovide("bot:mock").unwrap());
    assert_eq!(echo.state(), ForkState::Pending);

    // No middleware left, so the message resolves to null.
    let out = AdapterHost::deliver(&runtime, Session::private("mock", "42"))
        .await
        .unwrap();
    assert_eq!(out, Value::Null);
}
