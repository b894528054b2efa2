//! Listener callbacks and their arguments.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;

use chorus_types::error::HookError;
use chorus_types::session::Session;

/// What a listener returns: a value (`Value::Null` for "nothing") or an error.
pub type HookResult = Result<Value, HookError>;

/// Boxed future returned by asynchronous listeners.
pub type ListenerFuture = BoxFuture<'static, HookResult>;

type SyncFn = dyn Fn(&EventArgs) -> HookResult + Send + Sync;
type AsyncFn = dyn Fn(EventArgs) -> ListenerFuture + Send + Sync;

/// Arguments passed to every listener invocation.
#[derive(Debug, Clone)]
pub struct EventArgs {
    /// The event being dispatched.
    pub event: Arc<str>,
    /// The session that triggered the event, if any.
    pub session: Option<Arc<Session>>,
    /// Positional arguments. In waterfall/chain dispatch the first one is
    /// the accumulator.
    pub args: Vec<Value>,
}

impl EventArgs {
    /// Positional argument `index`, or `Value::Null` when absent.
    pub fn arg(&self, index: usize) -> &Value {
        self.args.get(index).unwrap_or(&Value::Null)
    }

    /// The session, when the dispatch carried one.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_deref()
    }
}

/// A registered event callback.
///
/// Synchronous listeners can run in every dispatch mode; asynchronous
/// listeners are rejected by [`chain`](super::Dispatcher::chain) and
/// [`bail_sync`](super::Dispatcher::bail_sync).
#[derive(Clone)]
pub enum Listener {
    /// Returns its result immediately.
    Sync(Arc<SyncFn>),
    /// Returns a future that resolves to the result.
    Async(Arc<AsyncFn>),
}

impl Listener {
    /// Wrap a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&EventArgs) -> HookResult + Send + Sync + 'static,
    {
        Listener::Sync(Arc::new(f))
    }

    /// Wrap an asynchronous closure.
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Listener::Async(Arc::new(move |args| f(args).boxed()))
    }

    /// Whether this listener can run in a synchronous dispatch.
    pub fn is_sync(&self) -> bool {
        matches!(self, Listener::Sync(_))
    }

    /// Run a synchronous listener, converting a panic into an error.
    ///
    /// Returns `None` for asynchronous listeners.
    pub(crate) fn call_sync(&self, args: &EventArgs) -> Option<HookResult> {
        match self {
            Listener::Sync(f) => Some(
                catch_unwind(AssertUnwindSafe(|| f(args)))
                    .unwrap_or_else(|payload| Err(panic_error(payload))),
            ),
            Listener::Async(_) => None,
        }
    }

    /// Run the listener to completion, converting a panic into an error.
    pub(crate) async fn call(&self, args: EventArgs) -> HookResult {
        match self {
            Listener::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(&args)))
                .unwrap_or_else(|payload| Err(panic_error(payload))),
            Listener::Async(f) => {
                let fut = match catch_unwind(AssertUnwindSafe(|| f(args))) {
                    Ok(fut) => fut,
                    Err(payload) => return Err(panic_error(payload)),
                };
                AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(panic_error(payload)))
            }
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Sync(_) => f.write_str("Listener::Sync"),
            Listener::Async(_) => f.write_str("Listener::Async"),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Turn a caught panic payload into a [`HookError::Panicked`].
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> HookError {
    HookError::Panicked(panic_message(payload.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(values: Vec<Value>) -> EventArgs {
        EventArgs {
            event: Arc::from("test"),
            session: None,
            args: values,
        }
    }

    #[test]
    fn arg_defaults_to_null() {
        let a = args(vec![json!(1)]);
        assert_eq!(a.arg(0), &json!(1));
        assert!(a.arg(5).is_null());
        assert!(a.session().is_none());
    }

    #[test]
    fn sync_listener_panic_is_caught() {
        let l = Listener::sync(|_| panic!("kaboom"));
        let out = l.call_sync(&args(vec![])).unwrap();
        assert_eq!(out, Err(HookError::Panicked("kaboom".into())));
    }

    #[test]
    fn async_listener_is_not_callable_synchronously() {
        let l = Listener::asynchronous(|_| async { Ok(Value::Null) });
        assert!(!l.is_sync());
        assert!(l.call_sync(&args(vec![])).is_none());
    }

    #[tokio::test]
    async fn async_listener_receives_args() {
        let l = Listener::asynchronous(|a: EventArgs| async move { Ok(a.arg(0).clone()) });
        assert_eq!(l.call(args(vec![json!("x")])).await, Ok(json!("x")));
    }

    #[tokio::test]
    async fn async_listener_panic_is_caught() {
        let l = Listener::asynchronous(|_| async {
            if true {
                panic!("late failure");
            }
            Ok(Value::Null)
        });
        let out = l.call(args(vec![])).await;
        assert_eq!(out, Err(HookError::Panicked("late failure".into())));
    }
}
