//! [`Context`] -- the handle plugins use to talk to the runtime.
//!
//! A context pairs a [`Scope`] with the fork that owns whatever is
//! registered through it. Narrowing helpers return new contexts with a
//! different scope but the same owner, so everything still goes away
//! when the plugin is torn down.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use chorus_types::error::Result;
use chorus_types::session::Session;

use crate::disposable::{DisposeFn, HookHandle, ListenerHandle, MiddlewareHandle};
use crate::fork::{ForkId, ForkState};
use crate::hooks::{HookOwner, HookResult, Listener, ParallelReport};
use crate::middleware::{MIDDLEWARE_EVENT, Middleware};
use crate::plugin::Plugin;
use crate::runtime::{Detach, Runtime};
use crate::scope::Scope;
use crate::services::ServiceHandle;
use crate::timer::TimerHandle;

/// A scoped, fork-owned view of a [`Runtime`].
#[derive(Clone)]
pub struct Context {
    runtime: Runtime,
    scope: Scope,
    fork: ForkId,
}

impl Context {
    pub(crate) fn new(runtime: Runtime, scope: Scope, fork: ForkId) -> Self {
        Self {
            runtime,
            scope,
            fork,
        }
    }

    /// The runtime this context belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Sessions this context's hooks apply to.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The fork that owns resources registered through this context.
    pub fn fork(&self) -> ForkId {
        self.fork
    }

    /// Current state of the owning fork.
    pub fn state(&self) -> ForkState {
        self.runtime
            .fork_state(self.fork)
            .unwrap_or(ForkState::Disposed)
    }

    /// Name of the plugin that owns this context.
    pub fn plugin_name(&self) -> Arc<str> {
        self.runtime
            .graph()
            .name(self.fork)
            .unwrap_or_else(|| Arc::from("<disposed>"))
    }

    // ── Scope narrowing ──────────────────────────────────────────────

    /// Same owner, different scope.
    pub fn with_scope(&self, scope: Scope) -> Context {
        Context::new(self.runtime.clone(), scope, self.fork)
    }

    /// Restrict to private sessions from `ids` (any user when empty).
    pub fn by_user<I, S>(&self, ids: I) -> Context
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intersect(&Scope::by_user(ids))
    }

    /// Restrict to group sessions in `ids` (any group when empty).
    pub fn by_group<I, S>(&self, ids: I) -> Context
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intersect(&Scope::by_group(ids))
    }

    /// Restrict to one platform. An empty name leaves the scope unchanged.
    pub fn by_platform(&self, platform: impl Into<String>) -> Context {
        self.intersect(&Scope::by_platform(platform))
    }

    /// Exclude sessions whose subject (user or group) is in `ids`.
    pub fn except<I, S>(&self, ids: I) -> Context
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.intersect(&Scope::except_subjects(ids))
    }

    /// Widen by `other`.
    pub fn plus(&self, other: &Scope) -> Context {
        self.with_scope(self.scope.union(other))
    }

    /// Remove `other`.
    pub fn minus(&self, other: &Scope) -> Context {
        self.with_scope(self.scope.difference(other))
    }

    /// Keep only what is also in `other`.
    pub fn intersect(&self, other: &Scope) -> Context {
        self.with_scope(self.scope.intersect(other))
    }

    /// Everything this context does not select.
    pub fn inverse(&self) -> Context {
        self.with_scope(self.scope.invert())
    }

    // ── Hooks ────────────────────────────────────────────────────────

    fn owner(&self) -> HookOwner {
        HookOwner {
            fork: self.fork,
            plugin: self.plugin_name(),
        }
    }

    /// Listen to `event` within this context's scope.
    pub fn on(&self, event: &str, listener: Listener) -> Result<ListenerHandle> {
        self.register_listener(event, listener, false)
    }

    /// Like [`on`](Self::on), but runs before every appended listener.
    pub fn before(&self, event: &str, listener: Listener) -> Result<ListenerHandle> {
        self.register_listener(event, listener, true)
    }

    fn register_listener(
        &self,
        event: &str,
        listener: Listener,
        prepend: bool,
    ) -> Result<ListenerHandle> {
        let inner = self.runtime.inner();
        inner.graph.ensure_active(self.fork)?;
        let entry = inner
            .hooks
            .register(event, self.scope.clone(), listener, prepend, self.owner())?;
        let handle = HookHandle::new(&inner.hooks, entry);
        self.bind(&handle)?;
        Ok(handle)
    }

    fn bind<L: Send + Sync + 'static>(&self, handle: &HookHandle<L>) -> Result<()> {
        let slot = self.runtime.attach(self.fork, Box::new(handle.clone()))?;
        handle.bind(self.runtime.detacher(self.fork, slot));
        Ok(())
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn off(&self, handle: &ListenerHandle) -> bool {
        handle.off()
    }

    /// Add a message middleware within this context's scope.
    pub fn middleware(&self, middleware: Middleware, prepend: bool) -> Result<MiddlewareHandle> {
        let inner = self.runtime.inner();
        inner.graph.ensure_active(self.fork)?;
        let registry = inner.middleware.registry();
        let entry = registry.register(
            MIDDLEWARE_EVENT,
            self.scope.clone(),
            middleware,
            prepend,
            self.owner(),
        )?;
        let handle = HookHandle::new(registry, entry);
        self.bind(&handle)?;
        Ok(handle)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Fire-and-forget dispatch.
    pub fn emit(&self, event: &str, session: Option<Arc<Session>>, args: Vec<Value>) {
        self.runtime.dispatcher().emit(event, session, args);
    }

    /// Concurrent dispatch; see [`Dispatcher::parallel`](crate::Dispatcher::parallel).
    pub async fn parallel(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        args: Vec<Value>,
    ) -> ParallelReport {
        self.runtime.dispatcher().parallel(event, session, args).await
    }

    /// First non-null result; see [`Dispatcher::bail`](crate::Dispatcher::bail).
    pub async fn bail(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        args: Vec<Value>,
    ) -> HookResult {
        self.runtime.dispatcher().bail(event, session, args).await
    }

    /// Synchronous [`bail`](Self::bail).
    pub fn bail_sync(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        args: Vec<Value>,
    ) -> HookResult {
        self.runtime.dispatcher().bail_sync(event, session, args)
    }

    /// Accumulating dispatch; see [`Dispatcher::waterfall`](crate::Dispatcher::waterfall).
    pub async fn waterfall(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        initial: Value,
        args: Vec<Value>,
    ) -> HookResult {
        self.runtime
            .dispatcher()
            .waterfall(event, session, initial, args)
            .await
    }

    /// Synchronous [`waterfall`](Self::waterfall).
    pub fn chain(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        initial: Value,
        args: Vec<Value>,
    ) -> HookResult {
        self.runtime
            .dispatcher()
            .chain(event, session, initial, args)
    }

    // ── Plugins ──────────────────────────────────────────────────────

    /// Install `plugin` as a child of this context's fork, inheriting its
    /// scope. Returns the child's context.
    ///
    /// A reused non-forkable fork keeps the scope it was first installed
    /// with, and so does the returned context.
    pub fn plugin(&self, plugin: Arc<dyn Plugin>, config: Value) -> Result<Context> {
        let fork = self
            .runtime
            .install(self.fork, plugin, self.scope.clone(), config)?;
        let scope = self
            .runtime
            .graph()
            .scope(fork)
            .unwrap_or_else(|| self.scope.clone());
        Ok(Context::new(self.runtime.clone(), scope, fork))
    }

    /// Dispose the owning fork and everything it installed. Returns
    /// `false` if it was already disposed.
    pub fn dispose(&self) -> bool {
        self.runtime.dispose_fork(self.fork)
    }

    /// Run `f` when the owning fork is torn down.
    pub fn on_dispose<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let label = format!("on_dispose of {}", self.plugin_name());
        self.runtime.attach(
            self.fork,
            Box::new(DisposeFn::new(label, move || {
                f();
                Ok(())
            })),
        )?;
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────────────

    /// Publish `value` as service `name`, owned by this fork.
    pub fn provide<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<()> {
        self.provide_handle(name, Arc::new(value))
    }

    /// Publish an already shared service value.
    pub fn provide_handle(&self, name: &str, value: ServiceHandle) -> Result<()> {
        self.runtime.provide(self.fork, name, value)
    }

    /// Withdraw service `name`. Returns `false` if nothing was provided.
    pub fn unprovide(&self, name: &str) -> Result<bool> {
        self.runtime.unprovide(name)
    }

    /// The current provider of `name`, if it is a `T`.
    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.runtime.services().get::<T>(name)
    }

    /// Whether `name` currently has a provider.
    pub fn has_service(&self, name: &str) -> bool {
        self.runtime.services().has(name)
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Run `task` after `delay` unless the fork is torn down first.
    ///
    /// The fork stops tracking the timer once it has fired or been
    /// cancelled.
    pub fn set_timeout<F>(&self, delay: Duration, task: F) -> Result<TimerHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (timer, detach) = self.attach_timer("timeout")?;
        let on_done = detach.clone();
        if let Err(e) = timer.start_timeout(delay, task, move || {
            on_done.run();
        }) {
            detach.run();
            return Err(e);
        }
        Ok(timer)
    }

    /// Run `tick` every `period` until the fork is torn down.
    pub fn set_interval<F, Fut>(&self, period: Duration, tick: F) -> Result<TimerHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (timer, detach) = self.attach_timer("interval")?;
        let on_done = detach.clone();
        if let Err(e) = timer.start_interval(period, tick, move || {
            on_done.run();
        }) {
            detach.run();
            return Err(e);
        }
        Ok(timer)
    }

    // Attached before the task is spawned, so a timer that finishes at
    // once still finds its slot.
    fn attach_timer(&self, label: &'static str) -> Result<(TimerHandle, Detach)> {
        self.runtime.inner().graph.ensure_active(self.fork)?;
        let timer = TimerHandle::new(label);
        let slot = self.runtime.attach(self.fork, Box::new(timer.clone()))?;
        Ok((timer, self.runtime.detacher(self.fork, slot)))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("runtime", &self.runtime.id())
            .field("fork", &self.fork)
            .field("scope", &self.scope)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_types::error::RuntimeError;
    use serde_json::json;

    #[test]
    fn narrowing_keeps_owner() {
        let rt = Runtime::default();
        let root = rt.root();
        let narrowed = root.by_user(["42"]).by_platform("qq");
        assert_eq!(narrowed.fork(), root.fork());
        assert!(narrowed.scope().contains(&Session::private("qq", "42")));
        assert!(!narrowed.scope().contains(&Session::private("tg", "42")));
        assert!(!narrowed.scope().contains(&Session::group("qq", "42", "42")));
    }

    #[test]
    fn scope_combinators() {
        let rt = Runtime::default();
        let root = rt.root();
        let users = root.by_user(["1", "2"]);
        assert_eq!(users.minus(&Scope::by_user(["2"])).scope(), &Scope::by_user(["1"]));
        assert_eq!(
            users.plus(&Scope::by_group(Vec::<String>::new())).scope(),
            &Scope::by_user(["1", "2"]).union(&Scope::by_group(Vec::<String>::new()))
        );
        assert!(root.inverse().scope().is_empty());
        assert!(root.except(["9"]).scope().contains(&Session::private("qq", "8")));
        assert!(!root.except(["9"]).scope().contains(&Session::private("qq", "9")));
    }

    #[test]
    fn hooks_inherit_context_scope() {
        let rt = Runtime::default();
        let ctx = rt.root().by_user(["42"]);
        ctx.on("message", Listener::sync(|_| Ok(json!("reply"))))
            .unwrap();

        let s42 = Arc::new(Session::private("qq", "42"));
        let s43 = Arc::new(Session::private("qq", "43"));
        assert_eq!(ctx.bail_sync("message", Some(s42), vec![]), Ok(json!("reply")));
        assert_eq!(ctx.bail_sync("message", Some(s43), vec![]), Ok(Value::Null));
    }

    #[test]
    fn off_removes_listener() {
        let rt = Runtime::default();
        let root = rt.root();
        let handle = root
            .on("ping", Listener::sync(|_| Ok(json!("pong"))))
            .unwrap();
        assert!(root.off(&handle));
        assert!(!root.off(&handle));
        assert_eq!(root.bail_sync("ping", None, vec![]), Ok(Value::Null));
    }

    #[test]
    fn removed_hooks_leave_the_fork() {
        let rt = Runtime::default();
        let root = rt.root();
        let fork = root.fork();
        let before = rt.graph().disposable_count(fork);

        for _ in 0..100 {
            let handle = root
                .on("ev", Listener::sync(|_| Ok(Value::Null)))
                .unwrap();
            assert!(root.off(&handle));
            let mw = root
                .middleware(Middleware::new(|_, next| next.run()), false)
                .unwrap();
            assert!(mw.off());
        }
        assert_eq!(rt.graph().disposable_count(fork), before);
        assert!(rt.inner().hooks.is_empty());
    }

    #[test]
    fn reused_plugin_context_keeps_install_scope() {
        let rt = Runtime::default();
        let root = rt.root();
        let single = Arc::new(crate::plugin::PluginFn::new("single", |_, _| Ok(())));

        let first = root.by_user(["1"]).plugin(single.clone(), Value::Null).unwrap();
        let again = root.by_group(["g"]).plugin(single, Value::Null).unwrap();
        assert_eq!(again.fork(), first.fork());
        assert_eq!(again.scope(), &Scope::by_user(["1"]));
    }

    #[test]
    fn empty_event_name_is_a_config_error() {
        let rt = Runtime::default();
        let err = rt
            .root()
            .on("", Listener::sync(|_| Ok(Value::Null)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidEventName(_)));
    }

    #[test]
    fn services_roundtrip_through_context() {
        let rt = Runtime::default();
        let root = rt.root();
        assert!(!root.has_service("answer"));
        root.provide("answer", 42u32).unwrap();
        assert_eq!(root.service::<u32>("answer").as_deref(), Some(&42));
        assert!(root.service::<String>("answer").is_none());
        assert!(root.unprovide("answer").unwrap());
        assert!(!root.unprovide("answer").unwrap());
        assert!(matches!(
            root.provide("bad name", 1u8),
            Err(RuntimeError::InvalidServiceName(_))
        ));
    }

    #[test]
    fn disposed_context_rejects_registration() {
        let rt = Runtime::default();
        let child = rt
            .root()
            .plugin(
                Arc::new(crate::plugin::PluginFn::new("child", |_, _| Ok(()))),
                Value::Null,
            )
            .unwrap();
        assert_eq!(child.state(), ForkState::Active);
        assert!(child.dispose());
        assert_eq!(child.state(), ForkState::Disposed);
        let err = child
            .on("message", Listener::sync(|_| Ok(Value::Null)))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ForkDisposed(_)));
    }
}
