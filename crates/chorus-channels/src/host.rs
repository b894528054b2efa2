//! [`AdapterManager`] -- runs platform adapters against a runtime.
//!
//! The manager is responsible for:
//!
//! - Registering [`AdapterFactory`] instances
//! - Building adapters from configuration
//! - Running each adapter in its own tokio task, and stopping it again
//! - Publishing each adapter's bot to the runtimes it serves

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chorus_core::{Runtime, RuntimeId};
use chorus_types::error::AdapterError;

use crate::traits::*;

/// A spawned adapter task and the token that stops it.
struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    async fn join(self, platform: &str) {
        if let Err(e) = self.task.await {
            warn!(platform = %platform, error = %e, "adapter task panicked");
        }
    }
}

/// Builds, runs and stops adapters, and publishes their bots.
pub struct AdapterManager {
    factories: RwLock<HashMap<String, Arc<dyn AdapterFactory>>>,
    /// Built adapters; ordered so bulk operations are deterministic.
    adapters: RwLock<BTreeMap<String, Arc<dyn Adapter>>>,
    running: Mutex<HashMap<String, Running>>,
    /// Platforms whose bot has been published, per runtime.
    exposed: RwLock<HashMap<RuntimeId, HashSet<String>>>,
    host: Arc<dyn AdapterHost>,
}

impl AdapterManager {
    /// Create a manager delivering into `host`.
    pub fn new(host: Arc<dyn AdapterHost>) -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            adapters: RwLock::new(BTreeMap::new()),
            running: Mutex::new(HashMap::new()),
            exposed: RwLock::new(HashMap::new()),
            host,
        }
    }

    /// Create a manager delivering into `runtime`.
    pub fn for_runtime(runtime: &Runtime) -> Self {
        Self::new(Arc::new(runtime.clone()))
    }

    /// Register `factory` for its platform. A factory registered earlier
    /// for the same platform is replaced.
    pub async fn register_factory(&self, factory: Arc<dyn AdapterFactory>) {
        let platform = factory.platform().to_owned();
        if self
            .factories
            .write()
            .await
            .insert(platform.clone(), factory)
            .is_some()
        {
            warn!(platform = %platform, "adapter factory replaced");
        } else {
            debug!(platform = %platform, "adapter factory registered");
        }
    }

    /// Build `platform`'s adapter from its JSON config section.
    ///
    /// The adapter is not started.
    pub async fn init_adapter(
        &self,
        platform: &str,
        config: &serde_json::Value,
    ) -> Result<(), AdapterError> {
        let factory = self
            .factories
            .read()
            .await
            .get(platform)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(platform.to_owned()))?;

        let adapter = factory.build(config)?;
        info!(platform = %platform, "adapter initialized");
        self.adapters
            .write()
            .await
            .insert(platform.to_owned(), adapter);
        Ok(())
    }

    async fn adapter(&self, platform: &str) -> Result<Arc<dyn Adapter>, AdapterError> {
        self.adapters
            .read()
            .await
            .get(platform)
            .cloned()
            .ok_or_else(|| AdapterError::NotFound(platform.to_owned()))
    }

    /// Spawn the task running `platform`'s adapter. Returns `false` if it
    /// was already running.
    pub async fn start_adapter(&self, platform: &str) -> Result<bool, AdapterError> {
        let adapter = self.adapter(platform).await?;

        let mut running = self.running.lock().await;
        if running.contains_key(platform) {
            debug!(platform = %platform, "adapter already running");
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let host = self.host.clone();
        let token = cancel.clone();
        let name = platform.to_owned();
        let task = tokio::spawn(async move {
            info!(platform = %name, "adapter starting");
            match adapter.start(host, token).await {
                Ok(()) => info!(platform = %name, "adapter stopped"),
                Err(e) => error!(platform = %name, error = %e, "adapter exited with error"),
            }
        });
        running.insert(platform.to_owned(), Running { cancel, task });
        Ok(true)
    }

    /// Start every initialized adapter that is not running yet. Returns
    /// how many were started.
    pub async fn start_all(&self) -> usize {
        let platforms: Vec<String> = self.adapters.read().await.keys().cloned().collect();

        let mut started = 0;
        for platform in &platforms {
            if let Ok(true) = self.start_adapter(platform).await {
                started += 1;
            }
        }
        started
    }

    /// Cancel `platform`'s adapter and wait for its task.
    pub async fn stop_adapter(&self, platform: &str) -> Result<(), AdapterError> {
        let running = self
            .running
            .lock()
            .await
            .remove(platform)
            .ok_or_else(|| AdapterError::NotFound(platform.to_owned()))?;

        info!(platform = %platform, "adapter stopping");
        running.cancel.cancel();
        running.join(platform).await;
        Ok(())
    }

    /// Cancel every running adapter at once, then wait for all of them.
    /// Returns how many were stopped.
    pub async fn shutdown(&self) -> usize {
        let drained: Vec<(String, Running)> = self.running.lock().await.drain().collect();
        for (_, running) in &drained {
            running.cancel.cancel();
        }

        let stopped = drained.len();
        for (platform, running) in drained {
            running.join(&platform).await;
        }
        info!(stopped, "adapters shut down");
        stopped
    }

    /// Whether `platform`'s adapter task is running.
    pub async fn is_running(&self, platform: &str) -> bool {
        self.running.lock().await.contains_key(platform)
    }

    /// Status reported by `platform`'s adapter, if one was built.
    pub async fn status(&self, platform: &str) -> Option<AdapterStatus> {
        self.adapters.read().await.get(platform).map(|a| a.status())
    }

    /// Publish each initialized adapter's bot on `runtime` as `bot:<platform>`.
    ///
    /// Bots already published on that runtime are skipped. Returns how many
    /// were newly published.
    pub async fn expose_bots(&self, runtime: &Runtime) -> Result<usize, AdapterError> {
        let adapters = self.adapters.read().await;
        let mut exposed = self.exposed.write().await;
        let done = exposed.entry(runtime.id()).or_default();
        let root = runtime.root();

        let mut published = 0;
        for (platform, adapter) in adapters.iter() {
            if done.contains(platform) {
                continue;
            }
            let bot: Arc<dyn Bot> = adapter.bot();
            root.provide(&bot_service_name(platform), bot)?;
            done.insert(platform.clone());
            published += 1;
            debug!(runtime = %runtime.id(), platform = %platform, "bot published");
        }
        Ok(published)
    }

    /// Runtimes this manager has published bots on.
    pub async fn attached_runtimes(&self) -> Vec<RuntimeId> {
        let mut ids: Vec<RuntimeId> = self.exposed.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Send through `platform`'s bot.
    pub async fn send_message(
        &self,
        platform: &str,
        channel_id: &str,
        content: &str,
    ) -> Result<MessageId, AdapterError> {
        let adapter = self.adapter(platform).await?;
        adapter.bot().send_message(channel_id, content).await
    }
}
