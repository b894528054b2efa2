//! Dispatch modes over a [`HookRegistry`] of [`Listener`]s.

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};

use chorus_types::error::HookError;
use chorus_types::session::Session;

use super::listener::{EventArgs, HookResult, Listener};
use super::registry::{HookEntry, HookId, HookRegistry};

/// Whether a listener result stops a bail dispatch.
///
/// Everything except `null` and `false` counts.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// The result of one listener in a [`Dispatcher::parallel`] dispatch.
#[derive(Debug, Clone)]
pub struct ListenerOutcome {
    /// Hook that produced this outcome.
    pub hook: HookId,
    /// Name of the plugin that owns the hook.
    pub plugin: Arc<str>,
    /// What the listener returned.
    pub result: HookResult,
}

/// Per-listener report of a [`Dispatcher::parallel`] dispatch, in
/// dispatch order.
#[derive(Debug, Clone, Default)]
pub struct ParallelReport {
    /// One entry per listener that ran.
    pub outcomes: Vec<ListenerOutcome>,
}

impl ParallelReport {
    /// Check if every listener succeeded.
    pub fn all_successful(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ListenerOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// Successful values, in dispatch order.
    pub fn values(&self) -> Vec<Value> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().cloned())
            .collect()
    }

    /// Number of listeners that ran.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether no listener ran.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Runs listeners for an event in one of the dispatch modes.
///
/// Every mode snapshots the matching listeners at the start of the
/// dispatch. Errors and panics are caught per listener and logged with
/// the owning plugin; they never escape into the caller's task except as
/// the returned [`HookResult`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HookRegistry<Listener>>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<HookRegistry<Listener>>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<HookRegistry<Listener>> {
        &self.registry
    }

    fn prepare(
        &self,
        event: &str,
        session: Option<&Arc<Session>>,
    ) -> (Arc<str>, Vec<Arc<HookEntry<Listener>>>) {
        let hooks = self.registry.matching(event, session.map(|s| &**s));
        debug!(event, listeners = hooks.len(), "dispatching");
        (Arc::from(event), hooks)
    }

    /// Fire-and-forget.
    ///
    /// Synchronous listeners run inline. Asynchronous listeners are spawned
    /// onto the current tokio runtime; without one they are skipped with a
    /// warning.
    pub fn emit(&self, event: &str, session: Option<Arc<Session>>, args: Vec<Value>) {
        let (name, hooks) = self.prepare(event, session.as_ref());
        let handle = Handle::try_current().ok();

        for entry in hooks {
            let call_args = EventArgs {
                event: name.clone(),
                session: session.clone(),
                args: args.clone(),
            };
            if entry.listener.is_sync() {
                if let Some(Err(e)) = entry.listener.call_sync(&call_args) {
                    log_failure(&entry, &e);
                }
                continue;
            }
            let Some(handle) = &handle else {
                warn!(
                    event = %name,
                    plugin = %entry.owner.plugin,
                    hook = %entry.id,
                    "no tokio runtime, skipping async listener"
                );
                continue;
            };
            handle.spawn(async move {
                if let Err(e) = entry.listener.call(call_args).await {
                    log_failure(&entry, &e);
                }
            });
        }
    }

    /// Run every matching listener concurrently and wait for all of them.
    ///
    /// A failing listener does not cancel its siblings.
    pub async fn parallel(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        args: Vec<Value>,
    ) -> ParallelReport {
        let (name, hooks) = self.prepare(event, session.as_ref());

        let futures = hooks.iter().map(|entry| {
            let call_args = EventArgs {
                event: name.clone(),
                session: session.clone(),
                args: args.clone(),
            };
            async move {
                let result = entry.listener.call(call_args).await;
                if let Err(e) = &result {
                    log_failure(entry, e);
                }
                ListenerOutcome {
                    hook: entry.id,
                    plugin: entry.owner.plugin.clone(),
                    result,
                }
            }
        });

        ParallelReport {
            outcomes: join_all(futures).await,
        }
    }

    /// Run listeners in order until one returns something other than
    /// `null` or `false`, and return that value.
    ///
    /// Returns `Ok(Value::Null)` when no listener produced a value. A
    /// listener error stops the dispatch and is returned.
    pub async fn bail(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        args: Vec<Value>,
    ) -> HookResult {
        let (name, hooks) = self.prepare(event, session.as_ref());

        for entry in &hooks {
            let call_args = EventArgs {
                event: name.clone(),
                session: session.clone(),
                args: args.clone(),
            };
            match entry.listener.call(call_args).await {
                Ok(value) if is_truthy(&value) => return Ok(value),
                Ok(_) => {}
                Err(e) => {
                    log_failure(entry, &e);
                    return Err(e);
                }
            }
        }
        Ok(Value::Null)
    }

    /// Synchronous [`bail`](Self::bail).
    ///
    /// Asynchronous listeners cannot run here; they are reported and
    /// skipped.
    pub fn bail_sync(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        args: Vec<Value>,
    ) -> HookResult {
        let (name, hooks) = self.prepare(event, session.as_ref());

        for entry in &hooks {
            let call_args = EventArgs {
                event: name.clone(),
                session: session.clone(),
                args: args.clone(),
            };
            match entry.listener.call_sync(&call_args) {
                Some(Ok(value)) if is_truthy(&value) => return Ok(value),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log_failure(entry, &e);
                    return Err(e);
                }
                None => {
                    let e = HookError::NotSynchronous {
                        event: name.to_string(),
                    };
                    warn!(
                        event = %name,
                        plugin = %entry.owner.plugin,
                        hook = %entry.id,
                        "{e}, skipped"
                    );
                }
            }
        }
        Ok(Value::Null)
    }

    /// Thread an accumulator through every listener in order.
    ///
    /// Each listener receives the current accumulator as its first
    /// argument, followed by `args`, and returns the next accumulator.
    pub async fn waterfall(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        initial: Value,
        args: Vec<Value>,
    ) -> HookResult {
        let (name, hooks) = self.prepare(event, session.as_ref());

        let mut acc = initial;
        for entry in &hooks {
            let call_args = EventArgs {
                event: name.clone(),
                session: session.clone(),
                args: with_accumulator(acc, &args),
            };
            acc = entry.listener.call(call_args).await.inspect_err(|e| {
                log_failure(entry, e);
            })?;
        }
        Ok(acc)
    }

    /// Synchronous [`waterfall`](Self::waterfall).
    ///
    /// Reaching an asynchronous listener stops the chain with
    /// [`HookError::NotSynchronous`].
    pub fn chain(
        &self,
        event: &str,
        session: Option<Arc<Session>>,
        initial: Value,
        args: Vec<Value>,
    ) -> HookResult {
        let (name, hooks) = self.prepare(event, session.as_ref());

        let mut acc = initial;
        for entry in &hooks {
            let call_args = EventArgs {
                event: name.clone(),
                session: session.clone(),
                args: with_accumulator(acc, &args),
            };
            let result = entry.listener.call_sync(&call_args).unwrap_or_else(|| {
                Err(HookError::NotSynchronous {
                    event: name.to_string(),
                })
            });
            acc = result.inspect_err(|e| log_failure(entry, e))?;
        }
        Ok(acc)
    }
}

fn with_accumulator(acc: Value, rest: &[Value]) -> Vec<Value> {
    let mut args = Vec::with_capacity(rest.len() + 1);
    args.push(acc);
    args.extend_from_slice(rest);
    args
}

fn log_failure(entry: &HookEntry<Listener>, err: &HookError) {
    error!(
        event = %entry.event,
        plugin = %entry.owner.plugin,
        fork = %entry.owner.fork,
        hook = %entry.id,
        error = %err,
        "listener failed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::ForkId;
    use crate::hooks::HookOwner;
    use crate::scope::Scope;
    use parking_lot::Mutex;
    use serde_json::json;

    fn owner() -> HookOwner {
        HookOwner {
            fork: ForkId(1),
            plugin: Arc::from("test"),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(HookRegistry::default()))
    }

    fn on(d: &Dispatcher, event: &str, prepend: bool, listener: Listener) {
        d.registry()
            .register(event, Scope::all(), listener, prepend, owner())
            .unwrap();
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str, ret: Value) -> Listener {
        let log = log.clone();
        Listener::sync(move |_| {
            log.lock().push(tag);
            Ok(ret.clone())
        })
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(0)));
        assert!(is_truthy(&json!("")));
    }

    #[test]
    fn emit_runs_sync_listeners_and_survives_errors() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        on(&d, "ev", false, Listener::sync(|_| Err(HookError::failed("nope"))));
        on(&d, "ev", false, Listener::sync(|_| panic!("boom")));
        on(&d, "ev", false, recorder(&log, "after", Value::Null));
        d.emit("ev", None, vec![]);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn emit_without_runtime_skips_async() {
        let d = dispatcher();
        on(&d, "ev", false, Listener::asynchronous(|_| async { Ok(Value::Null) }));
        d.emit("ev", None, vec![]);
    }

    #[tokio::test]
    async fn emit_spawns_async_listeners() {
        let d = dispatcher();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        on(
            &d,
            "ev",
            false,
            Listener::asynchronous(move |a: EventArgs| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(a.arg(0).clone());
                    }
                    Ok(Value::Null)
                }
            }),
        );
        d.emit("ev", None, vec![json!(7)]);
        assert_eq!(rx.await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn bail_visits_prepended_first() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        on(&d, "ev", false, recorder(&log, "A", Value::Null));
        on(&d, "ev", false, recorder(&log, "B", json!(false)));
        on(&d, "ev", true, recorder(&log, "C", Value::Null));

        let out = d.bail("ev", None, vec![]).await;
        assert_eq!(out, Ok(Value::Null));
        assert_eq!(*log.lock(), vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn bail_stops_at_first_value() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        on(&d, "ev", false, recorder(&log, "A", Value::Null));
        on(&d, "ev", false, recorder(&log, "B", json!("reply")));
        on(&d, "ev", false, recorder(&log, "C", json!("late")));

        assert_eq!(d.bail("ev", None, vec![]).await, Ok(json!("reply")));
        assert_eq!(*log.lock(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn bail_returns_listener_error() {
        let d = dispatcher();
        on(&d, "ev", false, Listener::sync(|_| Err(HookError::failed("bad"))));
        on(&d, "ev", false, Listener::sync(|_| Ok(json!(1))));
        assert_eq!(
            d.bail("ev", None, vec![]).await,
            Err(HookError::Failed("bad".into()))
        );
    }

    #[test]
    fn bail_sync_skips_async_listeners() {
        let d = dispatcher();
        on(&d, "ev", false, Listener::asynchronous(|_| async { Ok(json!("async")) }));
        on(&d, "ev", false, Listener::sync(|_| Ok(json!("sync"))));
        assert_eq!(d.bail_sync("ev", None, vec![]), Ok(json!("sync")));
    }

    #[tokio::test]
    async fn parallel_collects_every_outcome() {
        let d = dispatcher();
        on(&d, "ev", false, Listener::sync(|_| Ok(json!(1))));
        on(&d, "ev", false, Listener::asynchronous(|_| async { Err(HookError::failed("x")) }));
        on(&d, "ev", false, Listener::asynchronous(|_| async { Ok(json!(3)) }));

        let report = d.parallel("ev", None, vec![]).await;
        assert_eq!(report.len(), 3);
        assert!(!report.all_successful());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.values(), vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn parallel_with_no_listeners_is_empty() {
        let report = dispatcher().parallel("nothing", None, vec![]).await;
        assert!(report.is_empty());
        assert!(report.all_successful());
    }

    #[tokio::test]
    async fn waterfall_threads_accumulator() {
        let d = dispatcher();
        on(
            &d,
            "ev",
            false,
            Listener::sync(|a| Ok(json!(a.arg(0).as_i64().unwrap_or(0) + a.arg(1).as_i64().unwrap_or(0)))),
        );
        on(
            &d,
            "ev",
            false,
            Listener::asynchronous(|a: EventArgs| async move {
                Ok(json!(a.arg(0).as_i64().unwrap_or(0) * 10))
            }),
        );
        let out = d.waterfall("ev", None, json!(1), vec![json!(2)]).await;
        assert_eq!(out, Ok(json!(30)));
    }

    #[test]
    fn chain_rejects_async_listener() {
        let d = dispatcher();
        let log = Arc::new(Mutex::new(Vec::new()));
        on(&d, "ev", false, recorder(&log, "first", json!("a")));
        on(&d, "ev", false, Listener::asynchronous(|_| async { Ok(Value::Null) }));
        on(&d, "ev", false, recorder(&log, "never", json!("c")));

        let out = d.chain("ev", None, Value::Null, vec![]);
        assert_eq!(
            out,
            Err(HookError::NotSynchronous {
                event: "ev".into()
            })
        );
        assert_eq!(*log.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn dispatch_filters_by_scope() {
        let d = dispatcher();
        d.registry()
            .register(
                "message",
                Scope::by_user(["42"]),
                Listener::sync(|_| Ok(json!("reply"))),
                false,
                owner(),
            )
            .unwrap();

        let s42 = Arc::new(Session::private("qq", "42"));
        let s43 = Arc::new(Session::private("qq", "43"));
        assert_eq!(d.bail("message", Some(s42), vec![]).await, Ok(json!("reply")));
        assert_eq!(d.bail("message", Some(s43), vec![]).await, Ok(Value::Null));
    }
}
