//! [`Runtime`] -- owns the registries and drives fork lifecycles.
//!
//! The runtime is responsible for:
//!
//! - Installing plugins as forks and running their setup
//! - Gating activation on required services, and re-running setup when
//!   a provider comes back or is replaced
//! - Cascading, idempotent disposal of fork subtrees
//! - Delivering sessions: event listeners first, then middleware
//!
//! Lifecycle transitions are serialized by one re-entrant lock, so a
//! plugin's setup may install plugins or provide services itself. Hook
//! dispatch never takes that lock.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use tracing::{debug, error, warn};

use chorus_types::config::RuntimeConfig;
use chorus_types::error::{Result, RuntimeError};
use chorus_types::session::Session;

use crate::context::Context;
use crate::disposable::{Disposable, DisposeFn, dispose_all};
use crate::fork::{ForkId, ForkSetup, ForkState, PluginGraph, SlotId};
use crate::hooks::{
    Dispatcher, HookLimits, HookRegistry, HookResult, Listener, ParallelReport, panic_message,
};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::plugin::Plugin;
use crate::scope::Scope;
use crate::services::{ProviderToken, ServiceContainer, ServiceHandle};

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuntimeId(u64);

impl RuntimeId {
    fn next() -> Self {
        RuntimeId(NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "runtime-{}", self.0)
    }
}

pub(crate) struct RuntimeInner {
    id: RuntimeId,
    config: RuntimeConfig,
    pub(crate) hooks: Arc<HookRegistry<Listener>>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) middleware: MiddlewareChain,
    pub(crate) services: ServiceContainer,
    pub(crate) graph: PluginGraph,
    /// Withdrawal slot of each current provider, by service name.
    withdrawals: Mutex<HashMap<String, Detach>>,
    lifecycle: ReentrantMutex<()>,
    root: ForkId,
}

/// Forgets one attached resource once it no longer needs releasing:
/// a timeout that fired, a hook removed by hand, a replaced provider.
#[derive(Clone)]
pub(crate) struct Detach {
    runtime: Weak<RuntimeInner>,
    fork: ForkId,
    slot: SlotId,
}

impl Detach {
    pub(crate) fn run(&self) -> bool {
        self.runtime
            .upgrade()
            .is_some_and(|inner| inner.graph.detach(self.fork, self.slot))
    }
}

/// A scoped plugin runtime.
///
/// Cheap to clone; every clone refers to the same registries.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with validated `config`.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: RuntimeConfig) -> Self {
        let limits = HookLimits::from(&config);
        let hooks = Arc::new(HookRegistry::<Listener>::new(limits));
        let middleware = MiddlewareChain::new(
            Arc::new(HookRegistry::<Middleware>::new(limits)),
            config.max_middleware_depth,
        );
        let (graph, root) = PluginGraph::new();
        let id = RuntimeId::next();
        debug!(runtime = %id, "runtime created");

        Self {
            inner: Arc::new(RuntimeInner {
                id,
                dispatcher: Dispatcher::new(hooks.clone()),
                hooks,
                middleware,
                services: ServiceContainer::new(),
                graph,
                withdrawals: Mutex::new(HashMap::new()),
                lifecycle: ReentrantMutex::new(()),
                root,
                config,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// This runtime's id.
    pub fn id(&self) -> RuntimeId {
        self.inner.id
    }

    /// The configuration the runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Context of the root fork, unrestricted scope.
    pub fn root(&self) -> Context {
        Context::new(self.clone(), Scope::all(), self.inner.root)
    }

    /// The root fork's id.
    pub fn root_fork(&self) -> ForkId {
        self.inner.root
    }

    /// Event dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Middleware chain.
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.inner.middleware
    }

    /// Service container (read access; mutate through a [`Context`]).
    pub fn services(&self) -> &ServiceContainer {
        &self.inner.services
    }

    /// Fork graph (read access).
    pub fn graph(&self) -> &PluginGraph {
        &self.inner.graph
    }

    /// State of a fork.
    pub fn fork_state(&self, fork: ForkId) -> Option<ForkState> {
        self.inner.graph.state(fork)
    }

    /// Live children of a fork.
    pub fn fork_children(&self, fork: ForkId) -> Vec<ForkId> {
        self.inner.graph.children(fork)
    }

    /// Live forks of the plugin named `name`.
    pub fn forks_of(&self, name: &str) -> Vec<ForkId> {
        self.inner.graph.forks_of(name)
    }

    /// Deliver one inbound session.
    ///
    /// Every listener for `session.event` runs concurrently; for message
    /// sessions the middleware chain runs afterwards and its result is
    /// returned. Other events resolve to `null`.
    pub async fn deliver(&self, session: Session) -> HookResult {
        let session = Arc::new(session);
        let report: ParallelReport = self
            .inner
            .dispatcher
            .parallel(&session.event, Some(session.clone()), Vec::new())
            .await;
        if !report.all_successful() {
            debug!(
                event = %session.event,
                failures = report.failures().count(),
                "some listeners failed"
            );
        }

        if !session.is_message() {
            return Ok(Value::Null);
        }
        self.inner.middleware.run(session).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Install `plugin` under `parent`, activating it if its required
    /// services are present.
    ///
    /// Non-forkable plugins already installed under `parent` are reused.
    /// If the first setup fails, the new fork is disposed and the error
    /// returned.
    pub(crate) fn install(
        &self,
        parent: ForkId,
        plugin: Arc<dyn Plugin>,
        scope: Scope,
        config: Value,
    ) -> Result<ForkId> {
        let _lifecycle = self.inner.lifecycle.lock();
        let graph = &self.inner.graph;
        graph.ensure_active(parent)?;

        let required = plugin.required_services();
        let optional = plugin.optional_services();
        for name in required.iter().chain(&optional) {
            ServiceContainer::validate_name(name)?;
        }

        let name = plugin.name().to_string();
        if !plugin.forkable() {
            if let Some(existing) = graph.find_reusable(parent, &name) {
                warn!(plugin = %name, fork = %existing, "plugin already installed, reusing fork");
                return Ok(existing);
            }
        }

        let notify = plugin.reload_on_optional_change();
        let fork = graph.create(
            parent,
            ForkSetup {
                plugin,
                scope,
                config,
            },
        )?;
        for service in &required {
            self.inner.services.require(fork, service)?;
        }
        for service in &optional {
            self.inner.services.optional_use(fork, service, notify)?;
        }
        debug!(plugin = %name, %fork, %parent, "plugin installed");

        if let Err(e) = self.activate(fork) {
            self.dispose_fork(fork);
            return Err(e);
        }
        Ok(fork)
    }

    /// Run setup for a pending fork whose required services are present.
    ///
    /// Returns `Ok(false)` if the fork is not ready (or not pending). A
    /// failed setup rolls the fork back to pending.
    fn activate(&self, fork: ForkId) -> Result<bool> {
        let _lifecycle = self.inner.lifecycle.lock();
        let graph = &self.inner.graph;

        let required = graph.required(fork);
        if !self.inner.services.all_present(&required) {
            debug!(%fork, ?required, "fork waiting for services");
            return Ok(false);
        }
        let Some(setup) = graph.begin_activation(fork) else {
            return Ok(false);
        };

        let ctx = Context::new(self.clone(), setup.scope.clone(), fork);
        let reason = match catch_unwind(AssertUnwindSafe(|| {
            setup.plugin.apply(&ctx, &setup.config)
        })) {
            Ok(Ok(())) => {
                debug!(plugin = %setup.plugin.name(), %fork, "fork activated");
                return Ok(true);
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };

        if graph.begin_deactivation(fork) {
            self.teardown(fork);
            graph.finish_teardown(fork);
        }
        graph.set_error(fork, reason.clone());
        Err(RuntimeError::PluginSetup {
            plugin: setup.plugin.name().to_string(),
            reason,
        })
    }

    /// Tear an active fork down and leave it pending.
    fn deactivate(&self, fork: ForkId) {
        let _lifecycle = self.inner.lifecycle.lock();
        let graph = &self.inner.graph;
        if !graph.begin_deactivation(fork) {
            return;
        }
        debug!(%fork, "fork deactivated");
        self.teardown(fork);
        graph.finish_teardown(fork);
    }

    /// Release a fork's resources (newest first), then dispose its children.
    fn teardown(&self, fork: ForkId) {
        let disposables = self.inner.graph.take_disposables(fork);
        dispose_all(fork, disposables);
        for child in self.inner.graph.take_children(fork) {
            self.dispose_fork(child);
        }
    }

    /// Dispose a fork and everything below it. Returns `false` if it was
    /// already disposed.
    pub(crate) fn dispose_fork(&self, fork: ForkId) -> bool {
        let _lifecycle = self.inner.lifecycle.lock();
        let graph = &self.inner.graph;
        if !graph.begin_disposal(fork) {
            return false;
        }
        self.teardown(fork);
        self.inner.services.release(fork);
        graph.remove(fork);
        debug!(%fork, "fork disposed");
        true
    }

    /// Attach a resource to `fork`; if that fails, release it at once.
    pub(crate) fn attach(&self, fork: ForkId, disposable: Box<dyn Disposable>) -> Result<SlotId> {
        match self.inner.graph.push_disposable(fork, disposable) {
            Ok(slot) => Ok(slot),
            Err((e, disposable)) => {
                dispose_all(fork, vec![disposable]);
                Err(e)
            }
        }
    }

    pub(crate) fn detacher(&self, fork: ForkId, slot: SlotId) -> Detach {
        Detach {
            runtime: Arc::downgrade(&self.inner),
            fork,
            slot,
        }
    }

    // ── Services ─────────────────────────────────────────────────────

    /// Publish `value` as `name` on behalf of `owner`.
    ///
    /// Active dependents are torn down before the new provider becomes
    /// visible and set up again afterwards. The provider is withdrawn when
    /// `owner` is torn down, unless it was replaced in the meantime.
    pub(crate) fn provide(&self, owner: ForkId, name: &str, value: ServiceHandle) -> Result<()> {
        ServiceContainer::validate_name(name)?;
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.graph.ensure_active(owner)?;

        let Some(token) = self.swap_provider(name, Some((value, Some(owner)))) else {
            return Ok(());
        };
        let slot = self.attach(owner, Box::new(self.withdrawal(name, token)))?;
        self.inner
            .withdrawals
            .lock()
            .insert(name.to_string(), self.detacher(owner, slot));
        Ok(())
    }

    fn withdrawal(&self, name: &str, token: ProviderToken) -> DisposeFn {
        let runtime: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        let service = name.to_string();
        DisposeFn::new(format!("service {name:?}"), move || {
            if let Some(inner) = runtime.upgrade() {
                let runtime = Runtime { inner };
                if runtime.inner.services.is_current(&service, token) {
                    runtime.swap_provider(&service, None);
                }
            }
            Ok(())
        })
    }

    /// Remove the provider of `name`. Returns `false` if there was none.
    pub(crate) fn unprovide(&self, name: &str) -> Result<bool> {
        ServiceContainer::validate_name(name)?;
        let _lifecycle = self.inner.lifecycle.lock();
        if !self.inner.services.has(name) {
            return Ok(false);
        }
        self.swap_provider(name, None);
        Ok(true)
    }

    fn swap_provider(
        &self,
        name: &str,
        provider: Option<(ServiceHandle, Option<ForkId>)>,
    ) -> Option<ProviderToken> {
        let _lifecycle = self.inner.lifecycle.lock();
        let owner = provider.as_ref().and_then(|(_, owner)| *owner);
        let previous = self.inner.services.provider_owner(name);
        let dependents = self.inner.services.dependents(name);
        let affected: Vec<ForkId> = dependents
            .all()
            .into_iter()
            .filter(|fork| Some(*fork) != owner)
            .collect();

        // The old provider's withdrawal is stale from here on.
        let stale = self.inner.withdrawals.lock().remove(name);
        if let Some(stale) = stale {
            stale.run();
        }

        for fork in &affected {
            self.deactivate(*fork);
        }
        let token = self.inner.services.set_provider(name, provider);
        debug!(
            service = %name,
            present = token.is_some(),
            previous_owner = ?previous,
            owner = ?owner,
            restarting = affected.len(),
            optional_users = dependents.optional.len(),
            "service changed"
        );

        for fork in affected {
            if self.inner.graph.state(fork) != Some(ForkState::Pending) {
                continue;
            }
            if let Err(e) = self.activate(fork) {
                error!(%fork, service = %name, error = %e, "fork failed to restart");
            }
        }
        token
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::build(RuntimeConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("forks", &self.inner.graph.len())
            .field("hooks", &self.inner.hooks.len())
            .field("services", &self.inner.services.names())
            .finish()
    }
}
