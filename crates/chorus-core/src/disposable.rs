//! Resources owned by a fork and released when it is torn down.
//!
//! Every hook, middleware, timer and provided service registered through
//! a [`Context`](crate::Context) becomes a [`Disposable`] on the owning
//! fork. Teardown runs them in reverse registration order; each one is
//! isolated, so a failing disposable never prevents the others.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, error};

use chorus_types::error::Result;

use crate::fork::ForkId;
use crate::hooks::{HookEntry, HookRegistry, Listener};
use crate::middleware::Middleware;
use crate::runtime::Detach;

/// Something that can be released exactly once.
pub trait Disposable: Send + 'static {
    /// Short human-readable description, used in logs.
    fn describe(&self) -> String;

    /// Release the resource.
    fn dispose(self: Box<Self>) -> Result<()>;
}

/// Handle to a registered hook. Removing it is idempotent.
///
/// Clones share one fork slot: removing the hook through any of them
/// also drops it from the owning fork's resources.
pub struct HookHandle<L> {
    registry: Weak<HookRegistry<L>>,
    entry: Arc<HookEntry<L>>,
    detach: Arc<OnceLock<Detach>>,
}

/// Handle returned by [`Context::on`](crate::Context::on).
pub type ListenerHandle = HookHandle<Listener>;

/// Handle returned by [`Context::middleware`](crate::Context::middleware).
pub type MiddlewareHandle = HookHandle<Middleware>;

impl<L> HookHandle<L> {
    pub(crate) fn new(registry: &Arc<HookRegistry<L>>, entry: Arc<HookEntry<L>>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            entry,
            detach: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn bind(&self, detach: Detach) {
        let _ = self.detach.set(detach);
    }

    /// The registered entry.
    pub fn entry(&self) -> &Arc<HookEntry<L>> {
        &self.entry
    }

    /// Unregister the hook. Returns `false` if it was already removed.
    pub fn off(&self) -> bool {
        if let Some(detach) = self.detach.get() {
            detach.run();
        }
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(&self.entry))
    }
}

impl<L> Clone for HookHandle<L> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            entry: self.entry.clone(),
            detach: self.detach.clone(),
        }
    }
}

impl<L> fmt::Debug for HookHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("id", &self.entry.id)
            .field("event", &self.entry.event)
            .finish()
    }
}

impl<L: Send + Sync + 'static> Disposable for HookHandle<L> {
    fn describe(&self) -> String {
        format!("{} on {:?}", self.entry.id, self.entry.event)
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        self.off();
        Ok(())
    }
}

/// A disposable backed by a closure.
pub struct DisposeFn {
    label: String,
    f: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl DisposeFn {
    /// Wrap `f` under a log label.
    pub fn new<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            f: Box::new(f),
        }
    }
}

impl fmt::Debug for DisposeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisposeFn").field("label", &self.label).finish()
    }
}

impl Disposable for DisposeFn {
    fn describe(&self) -> String {
        self.label.clone()
    }

    fn dispose(self: Box<Self>) -> Result<()> {
        (self.f)()
    }
}

/// Run disposables newest-first, logging (and otherwise ignoring) failures.
pub(crate) fn dispose_all(fork: ForkId, disposables: Vec<Box<dyn Disposable>>) {
    for disposable in disposables.into_iter().rev() {
        let what = disposable.describe();
        match catch_unwind(AssertUnwindSafe(|| disposable.dispose())) {
            Ok(Ok(())) => debug!(%fork, resource = %what, "disposed"),
            Ok(Err(e)) => error!(%fork, resource = %what, error = %e, "dispose failed"),
            Err(_) => error!(%fork, resource = %what, "dispose panicked"),
        }
    }
}
