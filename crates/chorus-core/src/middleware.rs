//! Per-message middleware chain.
//!
//! Middleware is registered like any other hook (under the
//! [`MIDDLEWARE_EVENT`] name, with a scope and an owning fork) but is
//! invoked as a continuation chain: each step receives the session and a
//! [`Next`] handle, and decides whether the rest of the chain runs.
//!
//! Every dispatch owns an explicit continuation queue. [`Next::run`] pops
//! the following step off that queue; [`Next::splice`] pushes a step to
//! its front first, so it runs next in *this* dispatch only.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, ready};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use chorus_types::error::HookError;
use chorus_types::session::Session;

use crate::hooks::{HookRegistry, HookResult, panic_error};

/// Event name middleware is registered under.
pub const MIDDLEWARE_EVENT: &str = "middleware";

type MiddlewareFn = dyn Fn(Arc<Session>, Next) -> BoxFuture<'static, HookResult> + Send + Sync;

/// One middleware step.
#[derive(Clone)]
pub struct Middleware(Arc<MiddlewareFn>);

impl Middleware {
    /// Wrap an async closure taking the session and the continuation.
    ///
    /// ```
    /// use chorus_core::Middleware;
    ///
    /// let logger = Middleware::new(|session, next| async move {
    ///     if session.content.is_empty() {
    ///         return Ok(serde_json::Value::Null);
    ///     }
    ///     next.run().await
    /// });
    /// # let _ = logger;
    /// ```
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Session>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Middleware(Arc::new(move |session, next| f(session, next).boxed()))
    }

    fn invoke(&self, session: Arc<Session>, next: Next) -> BoxFuture<'static, HookResult> {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(session, next))) {
            Ok(fut) => AssertUnwindSafe(fut)
                .catch_unwind()
                .map(|r| r.unwrap_or_else(|payload| Err(panic_error(payload))))
                .boxed(),
            Err(payload) => ready(Err(panic_error(payload))).boxed(),
        }
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Middleware")
    }
}

struct Step {
    middleware: Middleware,
    plugin: Arc<str>,
}

/// State shared by every [`Next`] of one dispatch.
struct Dispatch {
    session: Arc<Session>,
    queue: Mutex<VecDeque<Step>>,
    steps: AtomicUsize,
    max_steps: usize,
    max_depth: usize,
    /// Plugin of the innermost step that failed.
    failed_in: Mutex<Option<Arc<str>>>,
}

/// Continuation handle passed to each middleware step.
///
/// Only the first call to [`run`](Self::run) or [`splice`](Self::splice)
/// on a given handle advances the chain; later calls are ignored with a
/// warning and resolve to `null`.
#[derive(Clone)]
pub struct Next {
    dispatch: Arc<Dispatch>,
    plugin: Arc<str>,
    used: Arc<AtomicBool>,
}

impl Next {
    fn new(dispatch: Arc<Dispatch>, plugin: Arc<str>) -> Self {
        Self {
            dispatch,
            plugin,
            used: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Plugin that owns the step holding this handle.
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// The session being dispatched.
    pub fn session(&self) -> &Arc<Session> {
        &self.dispatch.session
    }

    /// Number of steps still queued in this dispatch.
    pub fn remaining(&self) -> usize {
        self.dispatch.queue.lock().len()
    }

    fn claim(&self) -> bool {
        if self.used.swap(true, Ordering::SeqCst) {
            warn!(
                session = %self.dispatch.session.id,
                plugin = %self.plugin,
                "next() called more than once, ignoring"
            );
            return false;
        }
        true
    }

    /// Run the rest of the chain and return its result.
    ///
    /// Resolves to `null` once the chain is exhausted.
    pub fn run(self) -> BoxFuture<'static, HookResult> {
        if !self.claim() {
            return ready(Ok(Value::Null)).boxed();
        }
        advance(self.dispatch)
    }

    /// Run `step` next, then whatever remains of this dispatch.
    ///
    /// The step is attributed to the plugin that spliced it. Other
    /// dispatches are unaffected.
    pub fn splice(self, step: Middleware) -> BoxFuture<'static, HookResult> {
        if !self.claim() {
            return ready(Ok(Value::Null)).boxed();
        }
        self.dispatch.queue.lock().push_front(Step {
            middleware: step,
            plugin: self.plugin.clone(),
        });
        advance(self.dispatch)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("session", &self.dispatch.session.id)
            .field("plugin", &self.plugin)
            .field("remaining", &self.remaining())
            .field("used", &self.used.load(Ordering::SeqCst))
            .finish()
    }
}

fn advance(dispatch: Arc<Dispatch>) -> BoxFuture<'static, HookResult> {
    async move {
        let step = dispatch.queue.lock().pop_front();
        let Some(step) = step else {
            return Ok(Value::Null);
        };

        let n = dispatch.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if n > dispatch.max_steps {
            dispatch.queue.lock().clear();
            dispatch.failed_in.lock().get_or_insert(step.plugin);
            return Err(HookError::DepthExceeded {
                limit: dispatch.max_depth,
            });
        }

        debug!(plugin = %step.plugin, step = n, "middleware step");
        let next = Next::new(dispatch.clone(), step.plugin.clone());
        let result = step.middleware.invoke(dispatch.session.clone(), next).await;
        if let Err(e) = &result {
            debug!(plugin = %step.plugin, error = %e, "middleware step failed");
            // Inner steps finish first, so the first writer is the origin.
            dispatch.failed_in.lock().get_or_insert(step.plugin);
        }
        result
    }
    .boxed()
}

/// Runs the registered middleware for a session.
pub struct MiddlewareChain {
    registry: Arc<HookRegistry<Middleware>>,
    max_depth: usize,
}

impl MiddlewareChain {
    /// Create a chain over `registry`. `max_depth` bounds how many spliced
    /// steps one dispatch may add beyond the registered ones.
    pub fn new(registry: Arc<HookRegistry<Middleware>>, max_depth: usize) -> Self {
        Self {
            registry,
            max_depth,
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<HookRegistry<Middleware>> {
        &self.registry
    }

    /// Run the middleware whose scope admits `session`, in order.
    ///
    /// The returned value is whatever the chain produced: the value of the
    /// step that stopped it, or `null` once it was exhausted.
    pub async fn run(&self, session: Arc<Session>) -> HookResult {
        let dispatch = self.dispatch(session.clone());
        let result = advance(dispatch.clone()).await;
        if let Err(e) = &result {
            let plugin = dispatch
                .failed_in
                .lock()
                .clone()
                .unwrap_or_else(|| Arc::from("<unknown>"));
            error!(
                session = %session.id,
                platform = %session.platform,
                %plugin,
                error = %e,
                "middleware chain failed"
            );
        }
        result
    }

    fn dispatch(&self, session: Arc<Session>) -> Arc<Dispatch> {
        let queue: VecDeque<Step> = self
            .registry
            .matching(MIDDLEWARE_EVENT, Some(&*session))
            .into_iter()
            .map(|entry| Step {
                middleware: entry.listener.clone(),
                plugin: entry.owner.plugin.clone(),
            })
            .collect();
        let registered = queue.len();

        Arc::new(Dispatch {
            session,
            queue: Mutex::new(queue),
            steps: AtomicUsize::new(0),
            max_steps: registered + self.max_depth,
            max_depth: self.max_depth,
            failed_in: Mutex::new(None),
        })
    }
}
